use crate::io::queue_config::{step_name, JobDefaults, QueueSpec, Walltime};
use crate::types::{MinsarError, MinsarResult, SchedulerKind};
use std::fs;
use std::path::{Path, PathBuf};

/// A batch job file written for (part of) a run file
#[derive(Debug, Clone, PartialEq)]
pub struct JobFile {
    pub path: PathBuf,
    /// Job name, also the file stem
    pub name: String,
    pub tasks: usize,
    pub walltime: Walltime,
    /// Requested memory in MB
    pub memory: u64,
}

impl JobFile {
    /// Same job with a longer walltime, header rewritten in place
    pub fn with_walltime(&self, walltime: Walltime, scheduler: SchedulerKind) -> MinsarResult<Self> {
        let content = fs::read_to_string(&self.path)?;
        let (old, new) = match scheduler {
            SchedulerKind::Slurm => (
                format!("#SBATCH -t {}", self.walltime.to_slurm()),
                format!("#SBATCH -t {}", walltime.to_slurm()),
            ),
            SchedulerKind::Lsf => (
                format!("#BSUB -W {}", self.walltime.to_lsf()),
                format!("#BSUB -W {}", walltime.to_lsf()),
            ),
        };
        if !content.contains(&old) {
            return Err(MinsarError::InvalidFormat(format!(
                "{} has no walltime line '{}'",
                self.path.display(),
                old
            )));
        }
        fs::write(&self.path, content.replacen(&old, &new, 1))?;
        log::info!("{}: walltime {} -> {}", self.name, self.walltime, walltime);

        Ok(Self {
            walltime,
            ..self.clone()
        })
    }
}

/// Commands of a run file: one per non-empty, non-comment line
pub fn read_run_file<P: AsRef<Path>>(path: P) -> MinsarResult<Vec<String>> {
    let content = fs::read_to_string(path.as_ref())?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Writes scheduler job files for run files
pub struct JobBuilder<'a> {
    scheduler: SchedulerKind,
    queue: &'a QueueSpec,
    defaults: &'a JobDefaults,
    account: Option<String>,
    /// Add a memory request to the header
    request_memory: bool,
    /// Upper bound on tasks per job, below what fits on a node
    max_tasks_per_job: Option<usize>,
}

impl<'a> JobBuilder<'a> {
    pub fn new(scheduler: SchedulerKind, queue: &'a QueueSpec, defaults: &'a JobDefaults) -> Self {
        Self {
            scheduler,
            queue,
            defaults,
            account: None,
            request_memory: false,
            max_tasks_per_job: None,
        }
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn request_memory(mut self, yes: bool) -> Self {
        self.request_memory = yes;
        self
    }

    pub fn max_tasks_per_job(mut self, max: usize) -> Self {
        self.max_tasks_per_job = Some(max.max(1));
        self
    }

    /// Tasks one job holds for a step
    pub fn tasks_per_job(&self, step: &str) -> MinsarResult<usize> {
        let threads = self.defaults.step(step)?.num_threads;
        let fit = self.queue.tasks_per_node(threads);
        Ok(self.max_tasks_per_job.map_or(fit, |max| fit.min(max)))
    }

    /// Split a run file into job files written to `out_dir`
    /// (the run file's directory when `None`).
    pub fn write_jobs(&self, run_file: &Path, out_dir: Option<&Path>) -> MinsarResult<Vec<JobFile>> {
        let commands = read_run_file(run_file)?;
        let stem = run_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MinsarError::Config(format!("bad run file {}", run_file.display())))?;
        let out_dir = out_dir
            .map(Path::to_path_buf)
            .or_else(|| run_file.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        if commands.is_empty() {
            log::warn!("Run file {} has no commands", run_file.display());
            return Ok(Vec::new());
        }

        fs::create_dir_all(&out_dir)?;
        let step = step_name(&stem);
        let threads = self.defaults.step(step)?.num_threads;
        let per_job = self.tasks_per_job(step)?;

        let mut jobs = Vec::new();
        for (index, chunk) in commands.chunks(per_job).enumerate() {
            let name = format!("{}_{}", stem, index);
            let walltime = self.defaults.walltime(step, chunk.len(), self.queue)?;
            let memory = self.defaults.memory(step, chunk.len(), self.queue)?;
            let path = out_dir.join(format!("{}.job", name));

            let script = self.render(&name, &out_dir, chunk, walltime, memory, threads);
            fs::write(&path, script)?;

            jobs.push(JobFile {
                path,
                name,
                tasks: chunk.len(),
                walltime,
                memory,
            });
        }

        log::info!(
            "{}: {} commands -> {} jobs ({} tasks/job, walltime {})",
            stem,
            commands.len(),
            jobs.len(),
            per_job,
            jobs.first().map(|j| j.walltime).unwrap_or_default()
        );
        Ok(jobs)
    }

    /// Job script text: scheduler header, thread setup, commands
    pub fn render(
        &self,
        name: &str,
        log_dir: &Path,
        commands: &[String],
        walltime: Walltime,
        memory: u64,
        threads: usize,
    ) -> String {
        let log_base = log_dir.join(name);
        let log_base = log_base.display();
        let mut lines = vec!["#! /bin/bash".to_string()];

        match self.scheduler {
            SchedulerKind::Slurm => {
                lines.push(format!("#SBATCH -J {}", name));
                if let Some(account) = &self.account {
                    lines.push(format!("#SBATCH -A {}", account));
                }
                lines.push("#SBATCH -N 1".to_string());
                lines.push(format!("#SBATCH -n {}", commands.len()));
                lines.push(format!("#SBATCH -o {}_%J.o", log_base));
                lines.push(format!("#SBATCH -e {}_%J.e", log_base));
                lines.push(format!("#SBATCH -p {}", self.queue.queue));
                lines.push(format!("#SBATCH -t {}", walltime.to_slurm()));
                if self.request_memory && memory > 0 {
                    lines.push(format!("#SBATCH --mem={}M", memory));
                }
            }
            SchedulerKind::Lsf => {
                lines.push(format!("#BSUB -J {}", name));
                if let Some(account) = &self.account {
                    lines.push(format!("#BSUB -P {}", account));
                }
                lines.push(format!("#BSUB -o {}_%J.o", log_base));
                lines.push(format!("#BSUB -e {}_%J.e", log_base));
                lines.push(format!("#BSUB -q {}", self.queue.queue));
                lines.push(format!("#BSUB -n {}", commands.len()));
                lines.push("#BSUB -R \"span[hosts=1]\"".to_string());
                lines.push(format!("#BSUB -W {}", walltime.to_lsf()));
                if self.request_memory && memory > 0 {
                    lines.push(format!("#BSUB -R \"rusage[mem={}]\"", memory));
                }
            }
        }

        lines.push(String::new());
        lines.push(format!("export OMP_NUM_THREADS={}", threads));
        lines.push(String::new());

        if let [single] = commands {
            lines.push(single.clone());
        } else {
            lines.extend(commands.iter().map(|c| format!("{} &", c)));
            lines.push("wait".to_string());
        }

        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::queue_config::{JobDefaults, QueueTable};
    use tempfile::TempDir;

    fn tables() -> (QueueTable, JobDefaults) {
        let queues = QueueTable::parse(
            "PLATFORM_NAME QUEUENAME CPUS_PER_NODE THREADS_PER_CORE MEM_PER_NODE MAX_JOBS_PER_QUEUE MAX_TASKS_PER_QUEUE WALLTIME_FACTOR MAX_WALLTIME\n\
             stampede3 skx 16 1 192000 25 1000 1.0 48:00:00\n",
        )
        .unwrap();
        let defaults = JobDefaults::parse(
            "name c_walltime s_walltime c_memory s_memory num_threads\n\
             default 1:00:00 0 3000 0 2\n\
             unpack_topo_reference 0:05:00 0:00:30 4000 0 4\n",
        )
        .unwrap();
        (queues, defaults)
    }

    #[test]
    fn test_run_file_split_into_jobs() {
        let (queues, defaults) = tables();
        let queue = queues.find("stampede3", None).unwrap();
        let dir = TempDir::new().unwrap();
        let run_file = dir.path().join("run_01_unpack_topo_reference");
        let commands: Vec<String> = (0..6)
            .map(|i| format!("unpackFrame.py -i SLC/{} -o reference", i))
            .collect();
        fs::write(&run_file, format!("# header\n{}\n\n", commands.join("\n"))).unwrap();

        let jobs = JobBuilder::new(SchedulerKind::Slurm, queue, &defaults)
            .account("TG-EAR200012")
            .write_jobs(&run_file, None)
            .unwrap();

        // 16 cpus / 4 threads -> 4 tasks per job
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].tasks, 4);
        assert_eq!(jobs[1].tasks, 2);
        assert_eq!(jobs[0].name, "run_01_unpack_topo_reference_0");
        assert_eq!(jobs[0].walltime, Walltime::parse("0:07:00").unwrap());

        let script = fs::read_to_string(&jobs[0].path).unwrap();
        assert!(script.starts_with("#! /bin/bash\n#SBATCH -J run_01_unpack_topo_reference_0\n"));
        assert!(script.contains("#SBATCH -A TG-EAR200012\n"));
        assert!(script.contains("#SBATCH -p skx\n"));
        assert!(script.contains("#SBATCH -t 0:07:00\n"));
        assert!(script.contains("export OMP_NUM_THREADS=4\n"));
        assert!(script.contains("unpackFrame.py -i SLC/3 -o reference &\nwait\n"));
        assert!(!script.contains("--mem"));
    }

    #[test]
    fn test_lsf_header_and_single_task() {
        let (queues, defaults) = tables();
        let queue = queues.find("stampede3", None).unwrap();
        let builder = JobBuilder::new(SchedulerKind::Lsf, queue, &defaults).request_memory(true);

        let script = builder.render(
            "run_02_x_0",
            Path::new("/w/run_files"),
            &["smallbaselineApp.py P.template".to_string()],
            Walltime::parse("2:00:00").unwrap(),
            3000,
            2,
        );
        assert!(script.contains("#BSUB -q skx\n"));
        assert!(script.contains("#BSUB -W 02:00\n"));
        assert!(script.contains("#BSUB -o /w/run_files/run_02_x_0_%J.o\n"));
        assert!(script.contains("#BSUB -R \"rusage[mem=3000]\"\n"));
        assert!(script.ends_with("\nsmallbaselineApp.py P.template\n"));
        assert!(!script.contains("wait"));
    }

    #[test]
    fn test_walltime_rewrite() {
        let (queues, defaults) = tables();
        let queue = queues.find("stampede3", None).unwrap();
        let dir = TempDir::new().unwrap();
        let run_file = dir.path().join("run_03_merge");
        fs::write(&run_file, "merge.py\n").unwrap();

        let builder = JobBuilder::new(SchedulerKind::Slurm, queue, &defaults).max_tasks_per_job(1);
        let jobs = builder.write_jobs(&run_file, Some(&dir.path().join("jobs"))).unwrap();
        assert_eq!(jobs.len(), 1);

        let longer = jobs[0]
            .with_walltime(jobs[0].walltime.scale(1.2), SchedulerKind::Slurm)
            .unwrap();
        let script = fs::read_to_string(&longer.path).unwrap();
        assert!(script.contains("#SBATCH -t 1:12:00\n"));
        assert!(!script.contains("#SBATCH -t 1:00:00\n"));
    }
}
