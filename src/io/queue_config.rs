//! Queue limits (`queues.cfg`) and per-step job resources (`job_defaults.cfg`)
//!
//! Both files are whitespace separated tables with a header row naming the
//! columns. `#` starts a comment.

use crate::types::{MinsarError, MinsarResult};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Wall clock limit of a batch job, stored in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Walltime(u64);

impl Walltime {
    pub fn from_secs(secs: u64) -> Self {
        Walltime(secs)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Parse `H:MM:SS`, `H:MM` or a bare number of minutes
    pub fn parse(s: &str) -> MinsarResult<Self> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(':').collect();
        let numbers = parts
            .iter()
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MinsarError::InvalidFormat(format!("walltime '{}': {}", s, e)))?;

        let secs = match numbers.as_slice() {
            [minutes] => minutes * 60,
            [hours, minutes] => hours * 3600 + minutes * 60,
            [hours, minutes, seconds] => hours * 3600 + minutes * 60 + seconds,
            _ => {
                return Err(MinsarError::InvalidFormat(format!(
                    "walltime '{}' is not H:MM:SS",
                    s
                )))
            }
        };
        Ok(Walltime(secs))
    }

    /// Scale by a factor, rounding up to whole seconds
    pub fn scale(&self, factor: f64) -> Self {
        Walltime((self.0 as f64 * factor).ceil().max(0.0) as u64)
    }

    pub fn saturating_add(&self, other: Walltime) -> Self {
        Walltime(self.0.saturating_add(other.0))
    }

    /// SLURM style `H:MM:SS`
    pub fn to_slurm(&self) -> String {
        format!("{}:{:02}:{:02}", self.0 / 3600, (self.0 % 3600) / 60, self.0 % 60)
    }

    /// LSF style `HH:MM`, rounded up to the minute
    pub fn to_lsf(&self) -> String {
        let minutes = self.0.div_ceil(60);
        format!("{:02}:{:02}", minutes / 60, minutes % 60)
    }
}

impl std::fmt::Display for Walltime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_slurm())
    }
}

/// Split a config table into header-keyed rows
fn parse_table(text: &str) -> MinsarResult<Vec<HashMap<String, String>>> {
    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        match &header {
            None => header = Some(fields.iter().map(|f| f.to_lowercase()).collect()),
            Some(columns) => {
                if fields.len() != columns.len() {
                    return Err(MinsarError::InvalidFormat(format!(
                        "line {}: expected {} columns, found {}",
                        line_no + 1,
                        columns.len(),
                        fields.len()
                    )));
                }
                rows.push(
                    columns
                        .iter()
                        .cloned()
                        .zip(fields.iter().map(|f| f.to_string()))
                        .collect(),
                );
            }
        }
    }
    Ok(rows)
}

fn column<'a>(row: &'a HashMap<String, String>, name: &str) -> MinsarResult<&'a str> {
    row.get(name)
        .map(String::as_str)
        .ok_or_else(|| MinsarError::Config(format!("missing column {}", name.to_uppercase())))
}

fn number<T: std::str::FromStr>(row: &HashMap<String, String>, name: &str) -> MinsarResult<T>
where
    T::Err: std::fmt::Display,
{
    let value = column(row, name)?;
    value
        .parse::<T>()
        .map_err(|e| MinsarError::InvalidFormat(format!("{} = {}: {}", name, value, e)))
}

/// Limits of one queue on one HPC platform
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub platform: String,
    pub queue: String,
    pub cpus_per_node: usize,
    pub threads_per_core: usize,
    /// Memory per node in MB
    pub mem_per_node: u64,
    pub max_jobs_per_queue: usize,
    pub max_tasks_per_queue: usize,
    pub walltime_factor: f64,
    pub max_walltime: Walltime,
}

impl QueueSpec {
    /// Tasks that fit on one node when each uses `threads_per_task` threads
    pub fn tasks_per_node(&self, threads_per_task: usize) -> usize {
        let hw_threads = self.cpus_per_node * self.threads_per_core.max(1);
        (hw_threads / threads_per_task.max(1)).max(1)
    }
}

/// Parsed `queues.cfg`
#[derive(Debug, Clone, Default)]
pub struct QueueTable {
    queues: Vec<QueueSpec>,
}

impl QueueTable {
    pub fn parse(text: &str) -> MinsarResult<Self> {
        let queues = parse_table(text)?
            .iter()
            .map(|row| {
                Ok(QueueSpec {
                    platform: column(row, "platform_name")?.to_string(),
                    queue: column(row, "queuename")?.to_string(),
                    cpus_per_node: number(row, "cpus_per_node")?,
                    threads_per_core: number(row, "threads_per_core")?,
                    mem_per_node: number(row, "mem_per_node")?,
                    max_jobs_per_queue: number(row, "max_jobs_per_queue")?,
                    max_tasks_per_queue: number(row, "max_tasks_per_queue")?,
                    walltime_factor: number(row, "walltime_factor")?,
                    max_walltime: Walltime::parse(column(row, "max_walltime")?)?,
                })
            })
            .collect::<MinsarResult<Vec<_>>>()?;
        Ok(Self { queues })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> MinsarResult<Self> {
        log::debug!("Reading queue table: {}", path.as_ref().display());
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Queue for a platform; the first listed queue when `queue` is `None`
    pub fn find(&self, platform: &str, queue: Option<&str>) -> MinsarResult<&QueueSpec> {
        self.queues
            .iter()
            .filter(|q| q.platform.eq_ignore_ascii_case(platform))
            .find(|q| queue.map_or(true, |name| q.queue == name))
            .ok_or_else(|| {
                MinsarError::Config(format!(
                    "no queue '{}' for platform {} in queues.cfg",
                    queue.unwrap_or("<default>"),
                    platform
                ))
            })
    }
}

/// Resources of one processing step from `job_defaults.cfg`
#[derive(Debug, Clone, PartialEq)]
pub struct StepResources {
    pub name: String,
    /// Constant part of the walltime
    pub c_walltime: Walltime,
    /// Walltime added per task
    pub s_walltime: Walltime,
    /// Constant memory in MB
    pub c_memory: u64,
    /// Memory added per task in MB
    pub s_memory: u64,
    pub num_threads: usize,
}

/// Parsed `job_defaults.cfg`
#[derive(Debug, Clone, Default)]
pub struct JobDefaults {
    steps: HashMap<String, StepResources>,
}

/// Name of the fallback row for steps without their own entry
pub const DEFAULT_STEP: &str = "default";

impl JobDefaults {
    pub fn parse(text: &str) -> MinsarResult<Self> {
        let mut steps = HashMap::new();
        for row in parse_table(text)? {
            let step = StepResources {
                name: column(&row, "name")?.to_string(),
                c_walltime: Walltime::parse(column(&row, "c_walltime")?)?,
                s_walltime: Walltime::parse(column(&row, "s_walltime")?)?,
                c_memory: number(&row, "c_memory")?,
                s_memory: number(&row, "s_memory")?,
                num_threads: number(&row, "num_threads")?,
            };
            steps.insert(step.name.clone(), step);
        }
        Ok(Self { steps })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> MinsarResult<Self> {
        log::debug!("Reading job defaults: {}", path.as_ref().display());
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Resources for a step, falling back to the `default` row
    pub fn step(&self, name: &str) -> MinsarResult<&StepResources> {
        self.steps
            .get(name)
            .or_else(|| {
                log::debug!("No job defaults for step {}, using '{}'", name, DEFAULT_STEP);
                self.steps.get(DEFAULT_STEP)
            })
            .ok_or_else(|| {
                MinsarError::Config(format!(
                    "job_defaults.cfg has neither '{}' nor '{}'",
                    name, DEFAULT_STEP
                ))
            })
    }

    /// `(c + s * tasks) * walltime_factor`, capped at the queue maximum
    pub fn walltime(&self, step: &str, tasks: usize, queue: &QueueSpec) -> MinsarResult<Walltime> {
        let res = self.step(step)?;
        let per_task = Walltime::from_secs(res.s_walltime.as_secs().saturating_mul(tasks as u64));
        let walltime = res
            .c_walltime
            .saturating_add(per_task)
            .scale(queue.walltime_factor);
        Ok(walltime.min(queue.max_walltime))
    }

    /// `c + s * tasks` MB, capped at the node's memory
    pub fn memory(&self, step: &str, tasks: usize, queue: &QueueSpec) -> MinsarResult<u64> {
        let res = self.step(step)?;
        let memory = res.c_memory + res.s_memory * tasks as u64;
        Ok(memory.min(queue.mem_per_node))
    }
}

/// Step name of a run file: `run_01_unpack_topo_reference` -> `unpack_topo_reference`
pub fn step_name(run_file: &str) -> &str {
    let name = run_file.rsplit('/').next().unwrap_or(run_file);
    let Some(rest) = name.strip_prefix("run_") else {
        return name;
    };
    match rest.split_once('_') {
        Some((index, step)) if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => {
            step
        }
        _ => name,
    }
}
