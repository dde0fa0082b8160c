//! Runtime settings taken from the environment the pipeline scripts export

use crate::types::{MinsarError, MinsarResult, SchedulerKind};
use std::collections::HashMap;
use std::path::PathBuf;

/// Directory below `$MINSAR_HOME` holding `queues.cfg` and `job_defaults.cfg`
pub const DEFAULTS_SUBDIR: &str = "minsar/defaults";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of project directories (`$WORKDIR`, else `$SCRATCHDIR`)
    pub work_dir: PathBuf,
    /// Directory holding project templates (`$TEMPLATES`)
    pub template_dir: PathBuf,
    pub minsar_home: Option<PathBuf>,
    pub platform: Option<String>,
    pub queue: Option<String>,
    pub scheduler: SchedulerKind,
    pub user: String,
    /// Orbit cache and throttle state live here
    pub cache_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> MinsarResult<Self> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build settings from an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> MinsarResult<Self> {
        let get = |name: &str| vars.get(name).filter(|v| !v.trim().is_empty()).cloned();

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let work_dir = get("WORKDIR")
            .or_else(|| get("SCRATCHDIR"))
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("insarlab"));
        let minsar_home = get("MINSAR_HOME").map(PathBuf::from);
        let template_dir = get("TEMPLATES")
            .map(PathBuf::from)
            .or_else(|| minsar_home.as_ref().map(|h| h.join("samples")))
            .unwrap_or_else(|| work_dir.join("infiles"));

        let scheduler = match get("JOBSCHEDULER") {
            Some(s) => s.parse()?,
            None => SchedulerKind::Slurm,
        };

        let user = get("USER")
            .or_else(|| get("LOGNAME"))
            .ok_or_else(|| MinsarError::Config("neither USER nor LOGNAME is set".to_string()))?;

        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| home.join(".cache"))
            .join("minsar");

        let settings = Self {
            work_dir,
            template_dir,
            minsar_home,
            platform: get("PLATFORM_NAME"),
            queue: get("QUEUENAME"),
            scheduler,
            user,
            cache_dir,
        };
        log::debug!("Settings: {:?}", settings);
        Ok(settings)
    }

    /// Project directory for a template's project name
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.work_dir.join(project)
    }

    pub fn orbit_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("orbits")
    }

    /// Counter and lock files shared by concurrent submissions of this user
    pub fn throttle_dir(&self) -> PathBuf {
        self.cache_dir.join("throttle")
    }

    fn defaults_file(&self, name: &str) -> MinsarResult<PathBuf> {
        let home = self.minsar_home.as_ref().ok_or_else(|| {
            MinsarError::Config(format!("MINSAR_HOME is not set; cannot locate {}", name))
        })?;
        Ok(home.join(DEFAULTS_SUBDIR).join(name))
    }

    pub fn queues_file(&self) -> MinsarResult<PathBuf> {
        self.defaults_file("queues.cfg")
    }

    pub fn job_defaults_file(&self) -> MinsarResult<PathBuf> {
        self.defaults_file("job_defaults.cfg")
    }

    /// Platform name, required for queue lookups
    pub fn require_platform(&self) -> MinsarResult<&str> {
        self.platform
            .as_deref()
            .ok_or_else(|| MinsarError::Config("PLATFORM_NAME is not set".to_string()))
    }
}
