//! Platform detection from product metadata XML
//!
//! Sentinel-1 SAFE products carry the platform in `manifest.safe`
//! (`familyName` + `number`), TerraSAR-X deliveries in the product annotation
//! (`mission`).

use crate::core::registry::{SatelliteConfig, SatelliteRegistry};
use crate::types::{MinsarError, MinsarResult};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Platform string found in a metadata document, e.g. `SENTINEL-1A` or `TSX-1`
pub fn read_platform(xml: &str) -> MinsarResult<Option<String>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut family: Option<String> = None;
    let mut number: Option<String> = None;
    let mut mission: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| MinsarError::XmlParsing(e.to_string()))?
                    .trim()
                    .to_string();
                let in_platform =
                    path.len() >= 2 && path[path.len() - 2] == "platform";
                match path.last().map(String::as_str) {
                    Some("familyName") if in_platform => family = Some(text),
                    Some("number") if in_platform => number = Some(text),
                    Some("mission") if mission.is_none() => mission = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(MinsarError::XmlParsing(format!(
                    "error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    let platform = match (family, number, mission) {
        (Some(family), Some(number), _) => Some(format!("{}{}", family, number)),
        (Some(family), None, _) => Some(family),
        (None, _, Some(mission)) => Some(mission),
        _ => None,
    };
    log::debug!("Platform from metadata: {:?}", platform);
    Ok(platform)
}

/// Read `manifest.safe` out of a zipped SAFE product
pub fn read_zipped_manifest<P: AsRef<Path>>(zip_path: P) -> MinsarResult<String> {
    let zip_path = zip_path.as_ref();
    let mut archive = zip::ZipArchive::new(File::open(zip_path)?).map_err(|e| {
        MinsarError::InvalidFormat(format!("{}: {}", zip_path.display(), e))
    })?;

    let index = (0..archive.len())
        .find(|&i| {
            archive
                .by_index(i)
                .map(|f| f.name().ends_with("manifest.safe"))
                .unwrap_or(false)
        })
        .ok_or_else(|| {
            MinsarError::InvalidFormat(format!("no manifest.safe in {}", zip_path.display()))
        })?;

    let mut manifest = String::new();
    archive
        .by_index(index)
        .map_err(|e| MinsarError::InvalidFormat(e.to_string()))?
        .read_to_string(&mut manifest)?;
    Ok(manifest)
}

/// Detect a product's satellite: file name first, then its metadata
pub fn detect_product<'r, P: AsRef<Path>>(
    registry: &'r SatelliteRegistry,
    path: P,
) -> MinsarResult<&'r SatelliteConfig> {
    let path = path.as_ref();
    if let Some(config) = registry.detect_from_filename(&path.to_string_lossy()) {
        return Ok(config);
    }

    let xml = if path.is_dir() {
        let manifest = path.join("manifest.safe");
        if manifest.is_file() {
            std::fs::read_to_string(manifest)?
        } else {
            return Err(MinsarError::UnknownSatellite(path.display().to_string()));
        }
    } else if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("zip")) {
        read_zipped_manifest(path)?
    } else if path.extension().map_or(false, |e| e.eq_ignore_ascii_case("xml")) {
        std::fs::read_to_string(path)?
    } else {
        return Err(MinsarError::UnknownSatellite(path.display().to_string()));
    };

    let platform = read_platform(&xml)?.ok_or_else(|| {
        MinsarError::UnknownSatellite(format!("no platform in metadata of {}", path.display()))
    })?;
    registry.detect_from_platform(&platform)
}
