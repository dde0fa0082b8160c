//! Turns delivered archives into the layout stripmapStack expects
//!
//! Archives in the download directory are extracted next to themselves, then
//! the satellite's preparation script converts the extracted products into
//! per-date SLC directories.

use crate::core::registry::SatelliteConfig;
use crate::io::command::{CommandRunner, CommandSpec};
use crate::types::{MinsarError, MinsarResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Written into a product directory once its archive is fully extracted
pub const UNPACKED_MARKER: &str = ".unpacked";

/// Archive formats found in delivery directories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Gzip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".gz") {
            Some(ArchiveKind::Gzip)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }

    /// File name with the archive extension removed
    pub fn strip<'a>(&self, name: &'a str) -> &'a str {
        let lower = name.to_lowercase();
        let suffix_len = [".tar.gz", ".tgz", ".tar", ".gz", ".zip"]
            .iter()
            .find(|s| lower.ends_with(*s))
            .map_or(0, |s| s.len());
        &name[..name.len() - suffix_len]
    }
}

/// Extract a zip into `dest`, refusing entries that escape it
pub fn extract_zip(archive: &Path, dest: &Path) -> MinsarResult<usize> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?).map_err(|e| {
        MinsarError::Unpack(format!("{}: {}", archive.display(), e))
    })?;

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| MinsarError::Unpack(format!("{} entry {}: {}", archive.display(), i, e)))?;

        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            MinsarError::Unpack(format!(
                "{}: entry '{}' escapes the extraction directory",
                archive.display(),
                entry.name()
            ))
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }

    log::debug!("Extracted {} entries from {}", zip.len(), archive.display());
    Ok(zip.len())
}

/// Decompress a single gzipped file into `dest`
pub fn extract_gzip(archive: &Path, dest: &Path) -> MinsarResult<PathBuf> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| MinsarError::Unpack(format!("bad archive path {}", archive.display())))?;
    let target = dest.join(ArchiveKind::Gzip.strip(&name));

    let mut decoder = GzDecoder::new(File::open(archive)?);
    let mut out = File::create(&target)?;
    io::copy(&mut decoder, &mut out)
        .map_err(|e| MinsarError::Unpack(format!("{}: {}", archive.display(), e)))?;
    Ok(target)
}

/// Per-archive result of an unpack run
#[derive(Debug, Default)]
pub struct UnpackReport {
    pub extracted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Preparation command that was run after extraction
    pub prep_command: Option<CommandSpec>,
}

impl UnpackReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Unpacker<'a> {
    satellite: &'a SatelliteConfig,
    runner: &'a dyn CommandRunner,
    project_dir: PathBuf,
}

impl<'a> Unpacker<'a> {
    pub fn new(
        satellite: &'a SatelliteConfig,
        runner: &'a dyn CommandRunner,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            satellite,
            runner,
            project_dir: project_dir.into(),
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.project_dir.join(self.satellite.layout.download_dir)
    }

    pub fn slc_dir(&self) -> PathBuf {
        self.project_dir.join(self.satellite.layout.slc_dir)
    }

    /// Archives waiting in the download directory, sorted by name
    pub fn pending_archives(&self) -> MinsarResult<Vec<PathBuf>> {
        let dir = self.download_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut archives: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && ArchiveKind::from_path(p).is_some())
            .collect();
        archives.sort();
        Ok(archives)
    }

    /// Extract one archive into a sibling directory named after it.
    ///
    /// Extraction happens in a temporary directory that receives the
    /// [`UNPACKED_MARKER`] and is then renamed into place, so a half-extracted
    /// product never carries the final name. A dry run only reports the
    /// target directory.
    pub fn extract(&self, archive: &Path) -> MinsarResult<PathBuf> {
        let kind = ArchiveKind::from_path(archive).ok_or_else(|| {
            MinsarError::Unpack(format!("{} is not a supported archive", archive.display()))
        })?;
        let parent = archive.parent().unwrap_or_else(|| Path::new("."));
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let final_dir = parent.join(kind.strip(&name));

        if final_dir.join(UNPACKED_MARKER).is_file() {
            log::info!("{} already extracted", final_dir.display());
            return Ok(final_dir);
        }
        if self.runner.is_dry_run() {
            log::info!("[dry-run] extract {} -> {}", archive.display(), final_dir.display());
            return Ok(final_dir);
        }
        if final_dir.exists() {
            log::warn!(
                "{} exists but was not completely extracted, extracting again",
                final_dir.display()
            );
            fs::remove_dir_all(&final_dir)?;
        }

        let staging = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(parent)?;

        match kind {
            ArchiveKind::Zip => {
                extract_zip(archive, staging.path())?;
            }
            ArchiveKind::Gzip => {
                extract_gzip(archive, staging.path())?;
            }
            ArchiveKind::Tar | ArchiveKind::TarGz => {
                let flags = if kind == ArchiveKind::TarGz { "-xzf" } else { "-xf" };
                let command = CommandSpec::new("tar")
                    .arg(flags)
                    .arg(archive.to_string_lossy())
                    .arg("-C")
                    .arg(staging.path().to_string_lossy());
                let output = self.runner.run(&command)?;
                if !output.success() {
                    return Err(MinsarError::Unpack(format!(
                        "tar failed on {}: {}",
                        archive.display(),
                        output.stderr.trim()
                    )));
                }
            }
        }

        File::create(staging.path().join(UNPACKED_MARKER))?;
        let staged = staging.into_path();
        fs::rename(&staged, &final_dir)?;
        log::info!("Extracted {} -> {}", archive.display(), final_dir.display());
        Ok(final_dir)
    }

    /// stripmapStack preparation command for this satellite
    pub fn prep_command(&self) -> Option<CommandSpec> {
        self.satellite.unpack.prep_script().map(|script| {
            CommandSpec::new(script)
                .arg("-i")
                .arg(self.download_dir().to_string_lossy())
                .arg("-o")
                .arg(self.slc_dir().to_string_lossy())
        })
    }

    /// Extract every pending archive, then run the preparation script.
    ///
    /// Per-archive failures are collected; the preparation step only runs when
    /// every archive was extracted.
    pub fn unpack_all(&self) -> MinsarResult<UnpackReport> {
        let mut report = UnpackReport::default();
        if !self.satellite.needs_unpack {
            log::info!("{} products are used as delivered", self.satellite.name);
            return Ok(report);
        }

        let archives = self.pending_archives()?;
        log::info!(
            "Unpacking {} archives in {}",
            archives.len(),
            self.download_dir().display()
        );

        #[cfg(feature = "parallel")]
        let results: Vec<(PathBuf, MinsarResult<PathBuf>)> = archives
            .par_iter()
            .map(|a| (a.clone(), self.extract(a)))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let results: Vec<(PathBuf, MinsarResult<PathBuf>)> = archives
            .iter()
            .map(|a| (a.clone(), self.extract(a)))
            .collect();

        for (archive, result) in results {
            match result {
                Ok(dir) => report.extracted.push(dir),
                Err(e) => {
                    log::warn!("Failed to unpack {}: {}", archive.display(), e);
                    report.failed.push((archive, e.to_string()));
                }
            }
        }

        if !report.is_success() {
            return Ok(report);
        }

        if let Some(command) = self.prep_command() {
            if !self.runner.is_dry_run() {
                fs::create_dir_all(self.slc_dir())?;
            }
            log::info!("Preparing SLCs: {}", command.to_shell_string());
            let output = self.runner.run(&command)?;
            if !output.success() {
                return Err(MinsarError::Unpack(format!(
                    "{} exited with status {}: {}",
                    command.program,
                    output.status,
                    output.stderr.trim()
                )));
            }
            report.prep_command = Some(command);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_kind() {
        assert_eq!(ArchiveKind::from_path(Path::new("a/dims_op_oc_dfd2_1.tar.gz")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_path(Path::new("x.TGZ")), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_path(Path::new("x.tar")), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_path(Path::new("x.h5.gz")), Some(ArchiveKind::Gzip));
        assert_eq!(ArchiveKind::from_path(Path::new("x.zip")), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_path(Path::new("x.h5")), None);

        assert_eq!(ArchiveKind::TarGz.strip("dims_op.tar.gz"), "dims_op");
        assert_eq!(ArchiveKind::Gzip.strip("CSKS1_SCS_B.h5.gz"), "CSKS1_SCS_B.h5");
    }
}
