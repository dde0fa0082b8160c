//! Files, archives, downloads and external commands

pub mod command;
pub mod download;
pub mod manifest;
pub mod orbit;
pub mod project;
pub mod queue_config;
pub mod template;
pub mod unpack;

pub use command::{CommandOutput, CommandRunner, CommandSpec, DryRunner, SystemRunner};
pub use download::{list_downloaded, BoundingBox, DownloadRequest};
pub use manifest::{detect_product, read_platform};
pub use orbit::{OrbitCache, OrbitDownloader, OrbitManager, OrbitType, S1Product};
pub use project::ProjectName;
pub use queue_config::{JobDefaults, QueueSpec, QueueTable, StepResources, Walltime};
pub use template::Template;
pub use unpack::{ArchiveKind, UnpackReport, Unpacker};
