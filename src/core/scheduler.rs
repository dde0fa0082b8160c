//! Batch scheduler front-ends driven through their command line tools

use crate::core::jobs::JobFile;
use crate::io::command::{CommandRunner, CommandSpec};
use crate::types::{MinsarError, MinsarResult, SchedulerKind};

pub type JobId = String;

/// Scheduler-independent job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    OutOfMemory,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::Timeout
                | JobState::Cancelled
                | JobState::OutOfMemory
        )
    }

    /// Terminal states that fail the step
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Cancelled | JobState::OutOfMemory
        )
    }

    /// `sacct`/`squeue` state names (`CANCELLED by 1234` included)
    pub fn from_slurm(state: &str) -> JobState {
        let word = state.split_whitespace().next().unwrap_or("").trim_end_matches('+');
        match word {
            "PENDING" | "PD" | "CONFIGURING" | "CF" | "REQUEUED" | "SUSPENDED" => JobState::Pending,
            "RUNNING" | "R" | "COMPLETING" | "CG" => JobState::Running,
            "COMPLETED" | "CD" => JobState::Completed,
            "FAILED" | "F" | "NODE_FAIL" | "NF" | "BOOT_FAIL" | "DEADLINE" => JobState::Failed,
            "TIMEOUT" | "TO" => JobState::Timeout,
            "CANCELLED" | "CA" | "PREEMPTED" => JobState::Cancelled,
            "OUT_OF_MEMORY" | "OOM" => JobState::OutOfMemory,
            _ => JobState::Unknown,
        }
    }

    /// `bjobs` STAT column
    pub fn from_lsf(state: &str) -> JobState {
        match state.trim() {
            "PEND" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" => JobState::Pending,
            "RUN" | "PROV" => JobState::Running,
            "DONE" => JobState::Completed,
            "EXIT" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Jobs and tasks a user currently has queued or running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub jobs: usize,
    pub tasks: usize,
}

pub trait Scheduler {
    fn kind(&self) -> SchedulerKind;
    fn submit(&self, job: &JobFile) -> MinsarResult<JobId>;
    fn queue_status(&self, user: &str) -> MinsarResult<QueueStatus>;
    fn job_state(&self, id: &str) -> MinsarResult<JobState>;
    fn cancel(&self, id: &str) -> MinsarResult<()>;
}

/// Pick the front-end for a scheduler kind
pub fn scheduler_for<'a>(kind: SchedulerKind, runner: &'a dyn CommandRunner) -> Box<dyn Scheduler + 'a> {
    match kind {
        SchedulerKind::Slurm => Box::new(Slurm::new(runner)),
        SchedulerKind::Lsf => Box::new(Lsf::new(runner)),
    }
}

/// Sum rows of `<id> <tasks> ...` output
fn count_rows(stdout: &str, task_column: usize) -> MinsarResult<QueueStatus> {
    let mut status = QueueStatus::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let tasks = line
            .split_whitespace()
            .nth(task_column)
            .ok_or_else(|| MinsarError::Scheduler(format!("unexpected queue line '{}'", line)))?;
        let tasks = tasks
            .parse::<usize>()
            .map_err(|e| MinsarError::Scheduler(format!("bad task count in '{}': {}", line, e)))?;
        status.jobs += 1;
        status.tasks += tasks;
    }
    Ok(status)
}

pub struct Slurm<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Slurm<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl Scheduler for Slurm<'_> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn submit(&self, job: &JobFile) -> MinsarResult<JobId> {
        let command = CommandSpec::new("sbatch")
            .arg("--parsable")
            .arg(job.path.to_string_lossy());
        let output = self.runner.run(&command)?.check("sbatch")?;

        // --parsable prints `<id>` or `<id>;<cluster>`
        let id = output
            .stdout
            .trim()
            .split(';')
            .next()
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| {
                MinsarError::Scheduler(format!("cannot parse sbatch output '{}'", output.stdout.trim()))
            })?;
        log::info!("Submitted {} as job {}", job.name, id);
        Ok(id.to_string())
    }

    fn queue_status(&self, user: &str) -> MinsarResult<QueueStatus> {
        let command = CommandSpec::new("squeue")
            .args(["-h", "-u", user, "-O", "JobID,NumTasks"]);
        let output = self.runner.run(&command)?.check("squeue")?;
        count_rows(&output.stdout, 1)
    }

    fn job_state(&self, id: &str) -> MinsarResult<JobState> {
        let command = CommandSpec::new("sacct").args(["-n", "-X", "-P", "-j", id, "-o", "State"]);
        let output = self.runner.run(&command)?.check("sacct")?;
        if let Some(line) = output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
            return Ok(JobState::from_slurm(line));
        }

        // accounting lags behind for fresh jobs
        let command = CommandSpec::new("squeue").args(["-h", "-j", id, "-o", "%T"]);
        let output = self.runner.run(&command)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map_or(JobState::Unknown, JobState::from_slurm))
    }

    fn cancel(&self, id: &str) -> MinsarResult<()> {
        self.runner
            .run(&CommandSpec::new("scancel").arg(id))?
            .check("scancel")?;
        log::info!("Cancelled job {}", id);
        Ok(())
    }
}

pub struct Lsf<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Lsf<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl Scheduler for Lsf<'_> {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Lsf
    }

    fn submit(&self, job: &JobFile) -> MinsarResult<JobId> {
        let command = CommandSpec::new("bsub").stdin_from(&job.path);
        let output = self.runner.run(&command)?.check("bsub")?;

        // Job <12345> is submitted to queue <normal>.
        let stdout = output.stdout.trim();
        let id = stdout
            .find('<')
            .and_then(|start| {
                stdout[start + 1..]
                    .find('>')
                    .map(|end| &stdout[start + 1..start + 1 + end])
            })
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| MinsarError::Scheduler(format!("cannot parse bsub output '{}'", stdout)))?;
        log::info!("Submitted {} as job {}", job.name, id);
        Ok(id.to_string())
    }

    fn queue_status(&self, user: &str) -> MinsarResult<QueueStatus> {
        let command =
            CommandSpec::new("bjobs").args(["-u", user, "-noheader", "-o", "jobid slots"]);
        let output = self.runner.run(&command)?;
        // bjobs exits non-zero with "No unfinished job found"
        if output.stdout.trim().is_empty() {
            return Ok(QueueStatus::default());
        }
        count_rows(&output.stdout, 1)
    }

    fn job_state(&self, id: &str) -> MinsarResult<JobState> {
        let command = CommandSpec::new("bjobs").args(["-noheader", "-o", "stat", id]);
        let output = self.runner.run(&command)?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map_or(JobState::Unknown, JobState::from_lsf))
    }

    fn cancel(&self, id: &str) -> MinsarResult<()> {
        self.runner
            .run(&CommandSpec::new("bkill").arg(id))?
            .check("bkill")?;
        log::info!("Cancelled job {}", id);
        Ok(())
    }
}
