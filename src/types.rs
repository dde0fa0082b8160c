use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// ISCE2 processing stack a satellite's data is fed into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingStack {
    /// TOPS mode (Sentinel-1 IW bursts)
    #[serde(rename = "topsStack")]
    Tops,
    /// Stripmap mode (TerraSAR-X, COSMO-SkyMed, ALOS, ...)
    #[serde(rename = "stripmapStack")]
    Stripmap,
}

impl ProcessingStack {
    /// Template key prefix used by the stack (`topsStack.` / `stripmapStack.`)
    pub fn template_prefix(&self) -> &'static str {
        match self {
            ProcessingStack::Tops => "topsStack.",
            ProcessingStack::Stripmap => "stripmapStack.",
        }
    }
}

impl std::fmt::Display for ProcessingStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStack::Tops => write!(f, "topsStack"),
            ProcessingStack::Stripmap => write!(f, "stripmapStack"),
        }
    }
}

/// How SLC data is fetched for a satellite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMethod {
    /// SSARA federated query (UNAVCO/ASF/ESA archives)
    Ssara,
    /// ASF search API
    Asf,
    /// Sentinel-1 burst download (burst2safe)
    Burst,
    /// Data is staged by hand; nothing to download
    Manual,
}

impl DownloadMethod {
    pub const ALL: &'static [DownloadMethod] = &[
        DownloadMethod::Ssara,
        DownloadMethod::Asf,
        DownloadMethod::Burst,
        DownloadMethod::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadMethod::Ssara => "ssara",
            DownloadMethod::Asf => "asf",
            DownloadMethod::Burst => "burst",
            DownloadMethod::Manual => "manual",
        }
    }
}

impl std::fmt::Display for DownloadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DownloadMethod {
    type Err = MinsarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ssara" => Ok(DownloadMethod::Ssara),
            "asf" | "asf_search" => Ok(DownloadMethod::Asf),
            "burst" | "bursts" | "burst2safe" => Ok(DownloadMethod::Burst),
            "manual" | "none" => Ok(DownloadMethod::Manual),
            other => Err(MinsarError::DownloadMethod(format!(
                "unknown download method '{}'",
                other
            ))),
        }
    }
}

/// Handler that turns delivered archives into stack-ready SLCs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpackHandler {
    /// Products are consumed as delivered (Sentinel-1 SAFE zips)
    None,
    Tsx,
    Csk,
    Alos2,
    AlosRaw,
    /// Envisat and ERS raw products
    RawSensors,
    Rsat2,
}

impl UnpackHandler {
    /// stripmapStack preparation script run after extraction
    pub fn prep_script(&self) -> Option<&'static str> {
        match self {
            UnpackHandler::None => None,
            UnpackHandler::Tsx => Some("prepSlcTSX.py"),
            UnpackHandler::Csk => Some("prepSlcSensors.py"),
            UnpackHandler::Alos2 => Some("prepSlcALOS2.py"),
            UnpackHandler::AlosRaw => Some("prepRawALOS.py"),
            UnpackHandler::RawSensors => Some("prepRawSensors.py"),
            UnpackHandler::Rsat2 => Some("prepSlcRSAT2.py"),
        }
    }
}

impl std::fmt::Display for UnpackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnpackHandler::None => "none",
            UnpackHandler::Tsx => "tsx",
            UnpackHandler::Csk => "csk",
            UnpackHandler::Alos2 => "alos2",
            UnpackHandler::AlosRaw => "alosraw",
            UnpackHandler::RawSensors => "rawsensors",
            UnpackHandler::Rsat2 => "rsat2",
        };
        write!(f, "{}", name)
    }
}

/// Directory names used below the project directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirectoryLayout {
    /// Where downloaded products land
    pub download_dir: &'static str,
    /// Where the processing stack expects SLCs
    pub slc_dir: &'static str,
}

/// Orbit direction encoded in project names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "AT" => Some(Direction::Ascending),
            "DT" => Some(Direction::Descending),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Direction::Ascending => "AT",
            Direction::Descending => "DT",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Ascending => write!(f, "ascending"),
            Direction::Descending => write!(f, "descending"),
        }
    }
}

/// Batch system the jobs are submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerKind {
    Slurm,
    Lsf,
}

impl FromStr for SchedulerKind {
    type Err = MinsarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SLURM" => Ok(SchedulerKind::Slurm),
            "LSF" => Ok(SchedulerKind::Lsf),
            other => Err(MinsarError::Config(format!(
                "unsupported job scheduler '{}'",
                other
            ))),
        }
    }
}

/// Error types for pipeline orchestration
#[derive(Debug, thiserror::Error)]
pub enum MinsarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown satellite: {0}")]
    UnknownSatellite(String),

    #[error("Download method error: {0}")]
    DownloadMethod(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Unpack error: {0}")]
    Unpack(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("XML parsing error: {0}")]
    XmlParsing(String),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

/// Result type for orchestration operations
pub type MinsarResult<T> = Result<T, MinsarError>;
