//! Satellite dispatch and batch job orchestration

pub mod jobs;
pub mod registry;
pub mod scheduler;
pub mod throttle;

pub use jobs::{read_run_file, JobBuilder, JobFile};
pub use registry::{SatelliteConfig, SatelliteRegistry, BUILTIN_SATELLITES};
pub use scheduler::{scheduler_for, JobId, JobState, Lsf, QueueStatus, Scheduler, Slurm};
pub use throttle::{
    CountedJob, JobOutcome, StepReport, SubmissionLock, TaskCounter, Throttle, ThrottleConfig,
};
