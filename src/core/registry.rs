//! Satellite registry
//!
//! Maps a satellite, detected from an alias, a platform string, a product file
//! name or a processing template, to the configuration that decides how its
//! data is downloaded, laid out, unpacked and processed.

use crate::io::project::ProjectName;
use crate::io::template::Template;
use crate::types::{
    DirectoryLayout, DownloadMethod, MinsarError, MinsarResult, ProcessingStack, UnpackHandler,
};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

/// Static dispatch record for one satellite mission
#[derive(Debug, Clone, Serialize)]
pub struct SatelliteConfig {
    /// Canonical identifier, e.g. `SENTINEL1`
    pub id: &'static str,
    pub name: &'static str,
    /// Abbreviation used in project names (`Sen` in `GalapagosSenDT128`)
    pub abbreviation: &'static str,
    pub aliases: &'static [&'static str],
    /// Platform strings used by archives and product metadata
    pub platforms: &'static [&'static str],
    /// Regular expressions matched against product file names
    pub filename_patterns: &'static [&'static str],
    pub stack: ProcessingStack,
    pub download_default: DownloadMethod,
    pub download_allowed: &'static [DownloadMethod],
    pub layout: DirectoryLayout,
    pub unpack: UnpackHandler,
    pub needs_unpack: bool,
    pub needs_orbit_download: bool,
}

impl SatelliteConfig {
    pub fn allows(&self, method: DownloadMethod) -> bool {
        self.download_allowed.contains(&method)
    }
}

const STRIPMAP_LAYOUT: DirectoryLayout = DirectoryLayout {
    download_dir: "RAW_data",
    slc_dir: "SLC",
};

/// Built-in satellite table, in detection priority order
pub const BUILTIN_SATELLITES: &[SatelliteConfig] = &[
    SatelliteConfig {
        id: "SENTINEL1",
        name: "Sentinel-1",
        abbreviation: "Sen",
        aliases: &["Sen", "S1", "SENTINEL1", "Sentinel-1"],
        platforms: &[
            "SENTINEL-1",
            "SENTINEL-1A",
            "SENTINEL-1B",
            "SENTINEL-1C",
            "S1A",
            "S1B",
            "S1C",
        ],
        filename_patterns: &[
            r"^S1[ABC]_(IW|EW|SM|S[1-6])_SLC__",
            r"^S1_\d{6}_IW[123]_\d{8}T\d{6}_(VV|VH|HH|HV)_[0-9A-F]{4}-BURST",
        ],
        stack: ProcessingStack::Tops,
        download_default: DownloadMethod::Asf,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Asf, DownloadMethod::Burst],
        layout: DirectoryLayout {
            download_dir: "SLC",
            slc_dir: "SLC",
        },
        unpack: UnpackHandler::None,
        needs_unpack: false,
        needs_orbit_download: true,
    },
    SatelliteConfig {
        id: "TERRASARX",
        name: "TerraSAR-X / TanDEM-X",
        abbreviation: "Tsx",
        aliases: &["Tsx", "TerraSAR-X", "TanDEM-X", "TERRASARX"],
        platforms: &["TSX", "TDX", "TERRASAR-X", "TANDEM-X", "TSX-1", "TDX-1"],
        filename_patterns: &[r"^T[SD]X1_SAR__SSC", r"^dims_op_oc_dfd2_\d+"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Ssara,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Manual],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::Tsx,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "COSMOSKYMED",
        name: "COSMO-SkyMed",
        abbreviation: "Csk",
        aliases: &["Csk", "COSMO-SkyMed", "CosmoSkymed"],
        platforms: &["COSMO-SKYMED", "CSK", "CSKS1", "CSKS2", "CSKS3", "CSKS4", "CSG"],
        filename_patterns: &[r"^CSK(S[1-4])?_SCS_", r"^CSG_SSAR\d_SCS"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Ssara,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Manual],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::Csk,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "ALOS2",
        name: "ALOS-2 PALSAR-2",
        abbreviation: "Alos2",
        aliases: &["Alos2", "ALOS-2", "PALSAR-2"],
        platforms: &["ALOS-2", "ALOS2"],
        filename_patterns: &[
            r"^\d{10}_\d{6}_ALOS2",
            r"^(IMG|LED)-(HH|HV|VH|VV)-ALOS2",
            r"^ALOS2\d{9}-\d{6}",
        ],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Ssara,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Asf, DownloadMethod::Manual],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::Alos2,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "ALOS",
        name: "ALOS PALSAR",
        abbreviation: "Alos",
        aliases: &["Alos", "ALOS-1", "PALSAR"],
        platforms: &["ALOS", "ALOS-1"],
        filename_patterns: &[r"^ALPSRP\d{9}", r"^(IMG|LED)-(HH|HV)-ALPSRP"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Asf,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Asf],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::AlosRaw,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "ENVISAT",
        name: "Envisat ASAR",
        abbreviation: "Env",
        aliases: &["Env", "ASAR"],
        platforms: &["ENVISAT"],
        filename_patterns: &[r"^ASA_IM[SP]_1P", r"\.N1$"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Ssara,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Asf],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::RawSensors,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "ERS",
        name: "ERS-1 / ERS-2",
        abbreviation: "Ers",
        aliases: &["Ers"],
        platforms: &["ERS", "ERS-1", "ERS-2"],
        filename_patterns: &[r"^SAR_IM[SP]_1P", r"\.E[12]$"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Ssara,
        download_allowed: &[DownloadMethod::Ssara, DownloadMethod::Asf],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::RawSensors,
        needs_unpack: true,
        needs_orbit_download: false,
    },
    SatelliteConfig {
        id: "RADARSAT2",
        name: "RADARSAT-2",
        abbreviation: "Rsat2",
        aliases: &["Rsat2", "RSAT2"],
        platforms: &["RADARSAT-2", "RS2"],
        filename_patterns: &[r"^RS2_OK\d+_PK\d+"],
        stack: ProcessingStack::Stripmap,
        download_default: DownloadMethod::Manual,
        download_allowed: &[DownloadMethod::Manual],
        layout: STRIPMAP_LAYOUT,
        unpack: UnpackHandler::Rsat2,
        needs_unpack: true,
        needs_orbit_download: false,
    },
];

struct Entry {
    config: SatelliteConfig,
    patterns: Vec<Regex>,
}

/// Immutable lookup structure over a set of satellite configurations
pub struct SatelliteRegistry {
    entries: Vec<Entry>,
    by_alias: HashMap<String, usize>,
    by_platform: HashMap<String, usize>,
}

fn normalize(s: &str) -> String {
    s.trim().to_uppercase()
}

impl SatelliteRegistry {
    /// Build a registry, compiling file name patterns and checking that ids,
    /// aliases and platforms are unambiguous.
    pub fn new(configs: &[SatelliteConfig]) -> MinsarResult<Self> {
        let mut entries = Vec::with_capacity(configs.len());
        let mut by_alias = HashMap::new();
        let mut by_platform = HashMap::new();

        for (idx, config) in configs.iter().enumerate() {
            if !config.allows(config.download_default) {
                return Err(MinsarError::Config(format!(
                    "{}: default download method {} is not allowed",
                    config.id, config.download_default
                )));
            }
            if config.needs_unpack == (config.unpack == UnpackHandler::None) {
                return Err(MinsarError::Config(format!(
                    "{}: needs_unpack={} does not match unpack handler {}",
                    config.id, config.needs_unpack, config.unpack
                )));
            }

            let keys = std::iter::once(config.id)
                .chain(std::iter::once(config.abbreviation))
                .chain(config.aliases.iter().copied());
            for key in keys {
                match by_alias.insert(normalize(key), idx) {
                    Some(other) if other != idx => {
                        return Err(MinsarError::Config(format!(
                            "alias '{}' used by both {} and {}",
                            key, configs[other].id, config.id
                        )));
                    }
                    _ => {}
                }
            }

            for platform in config.platforms {
                if let Some(other) = by_platform.insert(normalize(platform), idx) {
                    if other != idx {
                        return Err(MinsarError::Config(format!(
                            "platform '{}' used by both {} and {}",
                            platform, configs[other].id, config.id
                        )));
                    }
                }
            }

            let patterns = config
                .filename_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()?;

            entries.push(Entry {
                config: config.clone(),
                patterns,
            });
        }

        log::debug!("Satellite registry built with {} satellites", entries.len());
        Ok(Self {
            entries,
            by_alias,
            by_platform,
        })
    }

    /// Registry over the built-in table, constructed once per process
    pub fn builtin() -> MinsarResult<&'static SatelliteRegistry> {
        static BUILTIN: OnceLock<Result<SatelliteRegistry, String>> = OnceLock::new();
        BUILTIN
            .get_or_init(|| SatelliteRegistry::new(BUILTIN_SATELLITES).map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| MinsarError::Config(e.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SatelliteConfig> {
        self.entries.iter().map(|e| &e.config)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match on id, abbreviation or alias, ignoring case
    pub fn resolve_alias(&self, name: &str) -> Option<&SatelliteConfig> {
        let key = normalize(name);
        if key.is_empty() {
            return None;
        }
        self.by_alias.get(&key).map(|&idx| &self.entries[idx].config)
    }

    /// Match a platform string or a comma separated platform list.
    ///
    /// Every list item must resolve to the same satellite.
    pub fn detect_from_platform(&self, platforms: &str) -> MinsarResult<&SatelliteConfig> {
        let mut found: Option<usize> = None;

        for item in platforms.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let key = normalize(item);
            let idx = self
                .by_platform
                .get(&key)
                .copied()
                .ok_or_else(|| MinsarError::UnknownSatellite(format!("platform '{}'", item)))?;

            match found {
                Some(prev) if prev != idx => {
                    return Err(MinsarError::Config(format!(
                        "platform list '{}' mixes {} and {}",
                        platforms, self.entries[prev].config.id, self.entries[idx].config.id
                    )));
                }
                _ => found = Some(idx),
            }
        }

        found
            .map(|idx| &self.entries[idx].config)
            .ok_or_else(|| MinsarError::UnknownSatellite("empty platform string".to_string()))
    }

    /// Match a product file name (a path is reduced to its file name)
    pub fn detect_from_filename(&self, path: &str) -> Option<&SatelliteConfig> {
        let trimmed = path.trim();
        let name = Path::new(trimmed)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| trimmed.to_string());
        if name.is_empty() {
            return None;
        }

        let hit = self
            .entries
            .iter()
            .find(|e| e.patterns.iter().any(|re| re.is_match(&name)))
            .map(|e| &e.config);

        match hit {
            Some(config) => log::debug!("{} detected as {}", name, config.id),
            None => log::debug!("No satellite pattern matches {}", name),
        }
        hit
    }

    /// Detect the satellite a processing template is set up for.
    ///
    /// Tries `ssaraopt.platform`, then the satellite abbreviation in the
    /// project name, then stack specific keys.
    pub fn detect_from_template(&self, template: &Template) -> MinsarResult<&SatelliteConfig> {
        if let Some(platform) = template.get_explicit("ssaraopt.platform") {
            let config = self.detect_from_platform(platform)?;
            log::info!("Template platform '{}' -> {}", platform, config.id);
            return Ok(config);
        }

        if let Some(project) = template.project() {
            let abbreviations: Vec<&str> = self.iter().map(|c| c.abbreviation).collect();
            match ProjectName::parse_with(project, &abbreviations) {
                Ok(name) => {
                    if let Some(config) = self.resolve_alias(&name.satellite) {
                        log::info!("Project name {} -> {}", project, config.id);
                        return Ok(config);
                    }
                }
                Err(e) => log::debug!("Project name not usable for detection: {}", e),
            }
        }

        let tops_prefix = ProcessingStack::Tops.template_prefix();
        if template.keys().any(|k| k.starts_with(tops_prefix)) {
            if let Some(config) = self.iter().find(|c| c.stack == ProcessingStack::Tops) {
                log::info!("Template has {} keys -> {}", tops_prefix, config.id);
                return Ok(config);
            }
        }

        Err(MinsarError::UnknownSatellite(format!(
            "cannot detect satellite for template {}",
            template.project().unwrap_or("<unnamed>")
        )))
    }

    /// Resolve the download method for a satellite. `None` selects the
    /// satellite's default; anything outside the allow-list is rejected.
    pub fn validate_download_method(
        &self,
        satellite: &SatelliteConfig,
        requested: Option<&str>,
    ) -> MinsarResult<DownloadMethod> {
        let method = match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => s.parse::<DownloadMethod>()?,
            None => return Ok(satellite.download_default),
        };

        if !satellite.allows(method) {
            let allowed: Vec<&str> = satellite.download_allowed.iter().map(|m| m.as_str()).collect();
            return Err(MinsarError::DownloadMethod(format!(
                "{} cannot be downloaded with '{}' (allowed: {})",
                satellite.name,
                method,
                allowed.join(", ")
            )));
        }
        Ok(method)
    }
}
