//! Throttled job submission
//!
//! Several workflows of one user may submit at the same time. Each submission
//! takes an exclusive lock file, checks the queue against the limits of
//! `queues.cfg` and a task counter shared through the file system, and only
//! then submits. Jobs are tracked until they finish; timed out jobs are
//! resubmitted with a longer walltime.

use crate::core::jobs::JobFile;
use crate::core::scheduler::{JobId, JobState, Scheduler};
use crate::io::queue_config::{QueueSpec, Walltime};
use crate::types::{MinsarError, MinsarResult};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const LOCK_FILE: &str = "submit.lock";
pub const COUNTER_FILE: &str = "task_counter";

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifies one lock holder across processes and threads
fn lock_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
}

/// Exclusive lock held while the queue is checked and a job submitted.
///
/// The lock file holds a token unique to its holder. Released when dropped,
/// unless the lock was broken and taken by someone else in the meantime.
#[derive(Debug)]
pub struct SubmissionLock {
    path: PathBuf,
    token: String,
}

impl SubmissionLock {
    /// Create the lock file atomically, breaking locks older than `stale_after`
    pub fn acquire(path: &Path, stale_after: Duration, wait: Duration) -> MinsarResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let token = lock_token();
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", token)?;
                    log::debug!("Acquired {}", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if file_age(path).map_or(false, |age| age > stale_after) {
                        Self::break_stale(path, &token, stale_after)?;
                        continue;
                    }
                    if started.elapsed() >= wait {
                        return Err(MinsarError::Timeout(format!(
                            "could not acquire {} within {:?}",
                            path.display(),
                            wait
                        )));
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move a stale lock aside under a name only this caller uses.
    ///
    /// Only one of several breakers can rename the file. If what was moved
    /// turns out to be a fresh lock, it is linked back into place.
    fn break_stale(path: &Path, token: &str, stale_after: Duration) -> MinsarResult<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = path.with_file_name(format!("{}.stale-{}", name, token));

        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        if file_age(&aside).map_or(true, |age| age > stale_after) {
            log::warn!("Broke stale lock {}", path.display());
        } else {
            // taken by another process between the age check and the rename
            match fs::hard_link(&aside, path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => log::warn!("Could not restore lock {}: {}", path.display(), e),
            }
        }
        match fs::remove_file(&aside) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn is_held(&self) -> bool {
        fs::read_to_string(&self.path).map_or(false, |text| text.trim() == self.token)
    }
}

impl Drop for SubmissionLock {
    fn drop(&mut self) {
        if !self.is_held() {
            log::warn!("Lock {} was taken over, leaving it in place", self.path.display());
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Could not remove lock {}: {}", self.path.display(), e);
        }
    }
}

/// One submitted job still counted against the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountedJob {
    pub id: JobId,
    pub tasks: usize,
    /// Seconds since the Unix epoch
    pub submitted: u64,
}

impl CountedJob {
    fn age(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Duration::from_secs(now.saturating_sub(self.submitted))
    }
}

/// Jobs submitted through the throttle and not yet seen finishing, one
/// `<id> <tasks> <submitted>` line each. Only touched while holding the
/// [`SubmissionLock`].
#[derive(Debug, Clone)]
pub struct TaskCounter {
    path: PathBuf,
}

impl TaskCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entries(&self) -> MinsarResult<Vec<CountedJob>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let bad = |line: &str| {
            MinsarError::InvalidFormat(format!("{}: bad entry '{}'", self.path.display(), line))
        };
        let mut entries = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(bad(line));
            }
            entries.push(CountedJob {
                id: fields[0].to_string(),
                tasks: fields[1].parse().map_err(|_| bad(line))?,
                submitted: fields[2].parse().map_err(|_| bad(line))?,
            });
        }
        Ok(entries)
    }

    /// Total tasks of all counted jobs
    pub fn read(&self) -> MinsarResult<usize> {
        Ok(self.entries()?.iter().map(|e| e.tasks).sum())
    }

    pub fn write(&self, entries: &[CountedJob]) -> MinsarResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for entry in entries {
            writeln!(tmp, "{} {} {}", entry.id, entry.tasks, entry.submitted)?;
        }
        tmp.persist(&self.path).map_err(|e| MinsarError::Io(e.error))?;
        Ok(())
    }

    /// Count a freshly submitted job; returns the new task total
    pub fn add(&self, id: &str, tasks: usize) -> MinsarResult<usize> {
        let mut entries = self.entries()?;
        entries.retain(|e| e.id != id);
        entries.push(CountedJob {
            id: id.to_string(),
            tasks,
            submitted: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        });
        self.write(&entries)?;
        Ok(entries.iter().map(|e| e.tasks).sum())
    }

    /// Stop counting the given jobs; unknown ids are ignored
    pub fn remove(&self, ids: &[&str]) -> MinsarResult<usize> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id.as_str()));
        if entries.len() != before {
            self.write(&entries)?;
        }
        Ok(entries.iter().map(|e| e.tasks).sum())
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_jobs: usize,
    pub max_tasks: usize,
    pub poll_interval: Duration,
    /// Give up submitting a job after waiting this long for queue room
    pub max_wait: Duration,
    pub stale_lock: Duration,
    /// Stop counting a job the scheduler has never reported after this long
    pub unseen_grace: Duration,
    pub max_resubmits: usize,
    /// Walltime multiplier for jobs resubmitted after a timeout
    pub timeout_factor: f64,
    pub max_walltime: Walltime,
}

impl ThrottleConfig {
    pub fn from_queue(queue: &QueueSpec) -> Self {
        Self {
            max_jobs: queue.max_jobs_per_queue,
            max_tasks: queue.max_tasks_per_queue,
            poll_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(48 * 3600),
            stale_lock: Duration::from_secs(600),
            unseen_grace: Duration::from_secs(600),
            max_resubmits: 1,
            timeout_factor: 1.2,
            max_walltime: queue.max_walltime,
        }
    }
}

/// Final state of one job of a step
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: JobFile,
    pub id: JobId,
    pub state: JobState,
    pub resubmits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub outcomes: Vec<JobOutcome>,
}

impl StepReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == JobState::Completed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.state != JobState::Completed)
    }
}

struct Tracked {
    job: JobFile,
    id: JobId,
    resubmits: usize,
    last_state: JobState,
}

pub struct Throttle<'a> {
    scheduler: &'a dyn Scheduler,
    user: String,
    config: ThrottleConfig,
    lock_path: PathBuf,
    counter: TaskCounter,
}

impl<'a> Throttle<'a> {
    /// Throttle keeping its lock and counter files in `state_dir`
    pub fn new(
        scheduler: &'a dyn Scheduler,
        user: impl Into<String>,
        config: ThrottleConfig,
        state_dir: &Path,
    ) -> Self {
        Self {
            scheduler,
            user: user.into(),
            config,
            lock_path: state_dir.join(LOCK_FILE),
            counter: TaskCounter::new(state_dir.join(COUNTER_FILE)),
        }
    }

    pub fn counter(&self) -> &TaskCounter {
        &self.counter
    }

    fn lock(&self) -> MinsarResult<SubmissionLock> {
        SubmissionLock::acquire(&self.lock_path, self.config.stale_lock, self.config.max_wait)
    }

    /// Submit once the queue has room for the job
    pub fn submit(&self, job: &JobFile) -> MinsarResult<JobId> {
        if job.tasks > self.config.max_tasks {
            return Err(MinsarError::Scheduler(format!(
                "{} needs {} tasks but the queue allows {}",
                job.name, job.tasks, self.config.max_tasks
            )));
        }

        let started = Instant::now();
        let mut waits = 0usize;
        loop {
            {
                let _lock = self.lock()?;
                self.prune()?;
                let status = self.scheduler.queue_status(&self.user)?;
                // jobs submitted moments ago may not show up in the queue yet
                let tasks = status.tasks.max(self.counter.read()?);

                if status.jobs < self.config.max_jobs && tasks + job.tasks <= self.config.max_tasks {
                    let id = self.scheduler.submit(job)?;
                    let total = self.counter.add(&id, job.tasks)?;
                    log::debug!(
                        "{}: queue jobs={} tasks={} -> counter {}",
                        job.name,
                        status.jobs,
                        status.tasks,
                        total
                    );
                    return Ok(id);
                }

                if waits % 10 == 0 {
                    log::info!(
                        "Queue full for {} (jobs {}/{}, tasks {}+{}/{}), waiting",
                        job.name,
                        status.jobs,
                        self.config.max_jobs,
                        tasks,
                        job.tasks,
                        self.config.max_tasks
                    );
                }
            }

            if started.elapsed() >= self.config.max_wait {
                return Err(MinsarError::Timeout(format!(
                    "no queue room for {} after {:?}",
                    job.name, self.config.max_wait
                )));
            }
            waits += 1;
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Drop counted jobs that finished or that the scheduler never reported.
    /// Caller holds the lock.
    fn prune(&self) -> MinsarResult<()> {
        let entries = self.counter.entries()?;
        let mut finished = Vec::new();
        for entry in &entries {
            let state = match self.scheduler.job_state(&entry.id) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!("Cannot check counted job {}: {}", entry.id, e);
                    continue;
                }
            };
            let unseen = state == JobState::Unknown && entry.age() > self.config.unseen_grace;
            if state.is_terminal() || unseen {
                log::debug!("No longer counting job {} ({})", entry.id, state);
                finished.push(entry.id.as_str());
            }
        }
        if !finished.is_empty() {
            self.counter.remove(&finished)?;
        }
        Ok(())
    }

    fn release(&self, ids: &[&str]) -> MinsarResult<()> {
        let _lock = self.lock()?;
        self.counter.remove(ids)?;
        Ok(())
    }

    /// Cancel jobs that will no longer be tracked and stop counting them
    fn abandon(&self, ids: &[&str]) {
        for id in ids {
            if let Err(e) = self.scheduler.cancel(id) {
                log::warn!("Could not cancel job {}: {}", id, e);
            }
        }
        if let Err(e) = self.release(ids) {
            log::warn!("Could not release {} jobs from the counter: {}", ids.len(), e);
        }
    }

    /// Poll until every job is finished, resubmitting timed out jobs.
    ///
    /// On error the jobs still being tracked are cancelled and released.
    pub fn wait_for(&self, jobs: Vec<(JobFile, JobId)>) -> MinsarResult<StepReport> {
        let mut active: Vec<Tracked> = jobs
            .into_iter()
            .map(|(job, id)| Tracked {
                job,
                id,
                resubmits: 0,
                last_state: JobState::Pending,
            })
            .collect();
        let mut report = StepReport::default();

        while !active.is_empty() {
            let mut still_active = Vec::with_capacity(active.len());
            let mut pending = active.into_iter();

            while let Some(tracked) = pending.next() {
                match self.poll(tracked, &mut report) {
                    Ok(Some(tracked)) => still_active.push(tracked),
                    Ok(None) => {}
                    Err((e, tracked)) => {
                        let ids: Vec<&str> = still_active
                            .iter()
                            .chain(tracked.iter())
                            .chain(pending.as_slice())
                            .map(|t| t.id.as_str())
                            .collect();
                        self.abandon(&ids);
                        return Err(e);
                    }
                }
            }

            active = still_active;
            if !active.is_empty() {
                thread::sleep(self.config.poll_interval);
            }
        }

        Ok(report)
    }

    /// One status check; returns the job if it must be polled again.
    /// On error the job is handed back when it is still in the queue.
    fn poll(
        &self,
        mut tracked: Tracked,
        report: &mut StepReport,
    ) -> Result<Option<Tracked>, (MinsarError, Option<Tracked>)> {
        let state = match self.scheduler.job_state(&tracked.id) {
            Ok(state) => state,
            Err(e) => return Err((e, Some(tracked))),
        };
        if state != tracked.last_state {
            log::info!("{} ({}): {}", tracked.job.name, tracked.id, state);
            tracked.last_state = state;
        }
        if !state.is_terminal() {
            return Ok(Some(tracked));
        }

        if let Err(e) = self.release(&[tracked.id.as_str()]) {
            return Err((e, None));
        }

        if state == JobState::Timeout && tracked.resubmits < self.config.max_resubmits {
            let longer = tracked
                .job
                .walltime
                .scale(self.config.timeout_factor)
                .min(self.config.max_walltime);
            if longer > tracked.job.walltime {
                let resubmitted = tracked
                    .job
                    .with_walltime(longer, self.scheduler.kind())
                    .and_then(|job| self.submit(&job).map(|id| (job, id)));
                let (job, id) = match resubmitted {
                    Ok(pair) => pair,
                    Err(e) => return Err((e, None)),
                };
                log::warn!(
                    "{} timed out; resubmitted as {} with walltime {}",
                    job.name,
                    id,
                    longer
                );
                return Ok(Some(Tracked {
                    job,
                    id,
                    resubmits: tracked.resubmits + 1,
                    last_state: JobState::Pending,
                }));
            }
            log::warn!("{} timed out at the queue's maximum walltime", tracked.job.name);
        }

        report.outcomes.push(JobOutcome {
            job: tracked.job,
            id: tracked.id,
            state,
            resubmits: tracked.resubmits,
        });
        Ok(None)
    }

    /// Submit every job of a step, then wait for all of them.
    /// Fails unless every job completed; if a submission fails, the jobs
    /// already submitted are cancelled.
    pub fn run_step(&self, jobs: &[JobFile]) -> MinsarResult<StepReport> {
        let mut submitted: Vec<(JobFile, JobId)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.submit(job) {
                Ok(id) => submitted.push((job.clone(), id)),
                Err(e) => {
                    let ids: Vec<&str> = submitted.iter().map(|(_, id)| id.as_str()).collect();
                    self.abandon(&ids);
                    return Err(e);
                }
            }
        }
        let report = self.wait_for(submitted)?;
        if report.is_success() {
            return Ok(report);
        }

        let failed: Vec<String> = report
            .failed()
            .map(|o| {
                log::error!("{} ({}) ended {}", o.job.name, o.id, o.state);
                format!("{} ({})", o.job.name, o.state)
            })
            .collect();
        Err(MinsarError::Scheduler(format!(
            "{} of {} jobs did not complete: {}",
            failed.len(),
            report.outcomes.len(),
            failed.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let lock = SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO).unwrap();
        assert!(path.exists());
        let second = SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO);
        assert!(matches!(second, Err(MinsarError::Timeout(_))));

        drop(lock);
        assert!(!path.exists());
        assert!(SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO).is_ok());
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, "99999\n").unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(file);

        let lock = SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO);
        assert!(lock.is_ok());
    }

    #[test]
    fn test_lock_taken_over_is_not_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);

        let lock = SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO).unwrap();
        // broken and re-taken by another workflow while we still held it
        fs::write(&path, "4242-1-0\n").unwrap();
        drop(lock);
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242-1-0\n");
    }

    #[test]
    fn test_breaking_leaves_no_files_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_FILE);
        fs::write(&path, "99999\n").unwrap();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();
        drop(file);

        let lock = SubmissionLock::acquire(&path, Duration::from_secs(600), Duration::ZERO).unwrap();
        assert!(lock.is_held());
        drop(lock);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_counter_tracks_jobs() {
        let dir = TempDir::new().unwrap();
        let counter = TaskCounter::new(dir.path().join("state").join(COUNTER_FILE));

        assert_eq!(counter.read().unwrap(), 0);
        assert_eq!(counter.add("101", 8).unwrap(), 8);
        assert_eq!(counter.add("102", 3).unwrap(), 11);
        // a repeated id replaces its entry
        assert_eq!(counter.add("102", 4).unwrap(), 12);
        assert_eq!(counter.remove(&["101", "999"]).unwrap(), 4);

        let entries = counter.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "102");
        assert!(entries[0].age() < Duration::from_secs(60));
    }

    #[test]
    fn test_counter_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(COUNTER_FILE);
        fs::write(&path, "101 four 0\n").unwrap();
        assert!(matches!(
            TaskCounter::new(&path).read(),
            Err(MinsarError::InvalidFormat(_))
        ));
    }
}
