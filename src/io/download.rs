use crate::core::registry::{SatelliteConfig, SatelliteRegistry};
use crate::io::command::{CommandRunner, CommandSpec};
use crate::io::template::Template;
use crate::types::{DownloadMethod, MinsarError, MinsarResult};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};

/// Geographic search box in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Parse the ISCE `S N W E` order used by `*.boundingBox` template keys
    pub fn parse_snwe(s: &str) -> MinsarResult<Self> {
        let values = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MinsarError::InvalidFormat(format!("bounding box '{}': {}", s, e)))?;

        let [south, north, west, east] = values[..] else {
            return Err(MinsarError::InvalidFormat(format!(
                "bounding box '{}' needs 4 values (S N W E)",
                s
            )));
        };
        if south >= north {
            return Err(MinsarError::InvalidFormat(format!(
                "bounding box '{}': south must be below north",
                s
            )));
        }
        Ok(Self {
            south,
            north,
            west,
            east,
        })
    }

    /// Closed WKT polygon, counter-clockwise from the south-west corner
    pub fn to_wkt(&self) -> String {
        format!(
            "POLYGON(({w} {s},{e} {s},{e} {n},{w} {n},{w} {s}))",
            w = self.west,
            e = self.east,
            s = self.south,
            n = self.north
        )
    }
}

/// `YYYYMMDD` (template style) or `YYYY-MM-DD` to `YYYY-MM-DD`
fn normalize_date(key: &str, value: &str) -> MinsarResult<String> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|e| MinsarError::InvalidFormat(format!("{} = {}: {}", key, value, e)))
}

/// Data search and download derived from a project template
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub satellite: &'static str,
    pub method: DownloadMethod,
    pub platforms: Vec<String>,
    pub relative_orbit: Option<String>,
    pub frames: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub beam_mode: Option<String>,
    pub collection_name: Option<String>,
    /// WKT search geometry
    pub intersects_with: Option<String>,
    pub parallel: usize,
    pub output_dir: PathBuf,
}

impl DownloadRequest {
    /// Build from `ssaraopt.*` keys; `method` overrides the satellite default
    pub fn from_template(
        registry: &SatelliteRegistry,
        template: &Template,
        method: Option<&str>,
        project_dir: &Path,
    ) -> MinsarResult<Self> {
        let satellite = registry.detect_from_template(template)?;
        let method = registry.validate_download_method(
            satellite,
            method.or_else(|| template.get_explicit("minsar.download_method")),
        )?;

        let mut platforms = template.get_list("ssaraopt.platform");
        if platforms.is_empty() {
            platforms = satellite.platforms.iter().take(1).map(|p| p.to_string()).collect();
        }

        let intersects_with = match template.get_explicit("ssaraopt.intersectsWith") {
            Some(wkt) => Some(wkt.to_string()),
            None => {
                let key = format!("{}boundingBox", satellite.stack.template_prefix());
                template
                    .get_explicit(&key)
                    .map(BoundingBox::parse_snwe)
                    .transpose()?
                    .map(|bbox| bbox.to_wkt())
            }
        };

        let request = Self {
            satellite: satellite.id,
            method,
            platforms,
            relative_orbit: template.get_explicit("ssaraopt.relativeOrbit").map(str::to_string),
            frames: template.get_list("ssaraopt.frame"),
            start_date: template
                .get_explicit("ssaraopt.startDate")
                .map(|v| normalize_date("ssaraopt.startDate", v))
                .transpose()?,
            end_date: template
                .get_explicit("ssaraopt.endDate")
                .map(|v| normalize_date("ssaraopt.endDate", v))
                .transpose()?,
            beam_mode: template.get_explicit("ssaraopt.beamMode").map(str::to_string),
            collection_name: template
                .get_explicit("ssaraopt.collectionName")
                .map(str::to_string),
            intersects_with,
            parallel: template.get_usize("ssaraopt.parallel")?.unwrap_or(5),
            output_dir: project_dir.join(satellite.layout.download_dir),
        };
        log::info!(
            "Download request for {}: method={}, platforms={}",
            request.satellite,
            request.method,
            request.platforms.join(",")
        );
        Ok(request)
    }

    fn query_args(&self) -> Vec<String> {
        let mut args = vec![format!("--platform={}", self.platforms.join(","))];
        if let Some(orbit) = &self.relative_orbit {
            args.push(format!("--relativeOrbit={}", orbit));
        }
        if !self.frames.is_empty() {
            args.push(format!("--frame={}", self.frames.join(",")));
        }
        if let Some(start) = &self.start_date {
            args.push(format!("--start={}", start));
        }
        if let Some(end) = &self.end_date {
            args.push(format!("--end={}", end));
        }
        if let Some(beam) = &self.beam_mode {
            args.push(format!("--beamMode={}", beam));
        }
        if let Some(wkt) = &self.intersects_with {
            args.push(format!("--intersectsWith={}", wkt));
        }
        args
    }

    /// External command performing the download, `None` for manual staging
    pub fn command(&self) -> Option<CommandSpec> {
        let spec = match self.method {
            DownloadMethod::Manual => return None,
            DownloadMethod::Ssara => {
                let mut spec = CommandSpec::new("ssara_federated_query.py").args(self.query_args());
                if let Some(collection) = &self.collection_name {
                    spec = spec.arg(format!("--collectionName={}", collection));
                }
                spec.arg(format!("--parallel={}", self.parallel))
                    .arg("--print")
                    .arg("--download")
            }
            DownloadMethod::Asf | DownloadMethod::Burst => {
                let product = if self.method == DownloadMethod::Burst {
                    "BURST"
                } else {
                    "SLC"
                };
                CommandSpec::new("asf_search_args.py")
                    .arg(format!("--product={}", product))
                    .args(self.query_args())
                    .arg(format!("--parallel={}", self.parallel))
                    .arg(format!("--dir={}", self.output_dir.display()))
                    .arg("--download")
            }
        };
        Some(spec.current_dir(&self.output_dir))
    }

    /// Create the download directory and run the download command
    pub fn run(&self, runner: &dyn CommandRunner) -> MinsarResult<()> {
        let Some(command) = self.command() else {
            log::info!(
                "{} data is staged manually into {}",
                self.satellite,
                self.output_dir.display()
            );
            return Ok(());
        };

        if !runner.is_dry_run() {
            fs::create_dir_all(&self.output_dir)?;
        }
        log::info!("Downloading with: {}", command.to_shell_string());
        let output = runner.run(&command)?;
        if !output.success() {
            return Err(MinsarError::Download(format!(
                "{} exited with status {}: {}",
                command.program,
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Products in `dir` whose file names match the satellite, sorted by name
pub fn list_downloaded(
    registry: &SatelliteRegistry,
    satellite: &SatelliteConfig,
    dir: &Path,
) -> MinsarResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            registry
                .detect_from_filename(&path.to_string_lossy())
                .map_or(false, |found| found.id == satellite.id)
        })
        .collect();
    files.sort();
    log::debug!("{} {} products in {}", files.len(), satellite.id, dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Template {
        Template::parse(
            "ssaraopt.platform = SENTINEL-1A,SENTINEL-1B\n\
             ssaraopt.relativeOrbit = 128\n\
             ssaraopt.startDate = 20160601\n\
             ssaraopt.endDate = 20161230\n\
             topsStack.boundingBox = -1 0.15 -91.6 -90.9\n",
        )
        .unwrap()
        .with_project("GalapagosSenDT128")
    }

    #[test]
    fn test_bounding_box() {
        let bbox = BoundingBox::parse_snwe("-1 0.15 -91.6 -90.9").unwrap();
        assert_eq!(
            bbox.to_wkt(),
            "POLYGON((-91.6 -1,-90.9 -1,-90.9 0.15,-91.6 0.15,-91.6 -1))"
        );
        assert!(BoundingBox::parse_snwe("1 2 3").is_err());
        assert!(BoundingBox::parse_snwe("2 1 3 4").is_err());
    }

    #[test]
    fn test_request_from_template() {
        let registry = SatelliteRegistry::builtin().unwrap();
        let req =
            DownloadRequest::from_template(registry, &template(), None, Path::new("/w/P")).unwrap();

        assert_eq!(req.satellite, "SENTINEL1");
        assert_eq!(req.method, DownloadMethod::Asf);
        assert_eq!(req.start_date.as_deref(), Some("2016-06-01"));
        assert_eq!(req.output_dir, PathBuf::from("/w/P/SLC"));

        let cmd = req.command().unwrap();
        assert_eq!(cmd.program, "asf_search_args.py");
        assert!(cmd.args.contains(&"--product=SLC".to_string()));
        assert!(cmd.args.contains(&"--relativeOrbit=128".to_string()));
        assert!(cmd.args.contains(&"--end=2016-12-30".to_string()));
    }

    #[test]
    fn test_ssara_and_rejected_methods() {
        let registry = SatelliteRegistry::builtin().unwrap();
        let req = DownloadRequest::from_template(registry, &template(), Some("ssara"), Path::new("/w"))
            .unwrap();
        let line = req.command().unwrap().to_shell_string();
        assert!(line.starts_with("ssara_federated_query.py --platform=SENTINEL-1A,SENTINEL-1B"));
        assert!(line.ends_with("--parallel=5 --print --download"));

        assert!(
            DownloadRequest::from_template(registry, &template(), Some("manual"), Path::new("/w"))
                .is_err()
        );
    }

    #[test]
    fn test_list_downloaded_filters_by_satellite() {
        let registry = SatelliteRegistry::builtin().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        for name in [
            "S1B_IW_SLC__1SDV_20200103T170815_20200103T170842_019840_025771_AAAA.zip",
            "S1A_IW_SLC__1SDV_20200101T170815_20200101T170842_030610_038200_BBBB.zip",
            "TSX1_SAR__SSC______SM_S_SRA_20200101T000000_20200101T000008.tar",
            "notes.txt",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let s1 = registry.resolve_alias("Sen").unwrap();
        let files = list_downloaded(registry, s1, dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].to_string_lossy().contains("S1A_"));
    }
}
