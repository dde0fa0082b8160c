use crate::types::{MinsarError, MinsarResult};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// ESA STEP server root for Sentinel-1 orbit files
pub const ESA_STEP_ORBIT_URL: &str = "https://step.esa.int/auxdata/orbits/Sentinel-1";

/// Orbit file types available from ESA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrbitType {
    /// Precise Orbit Ephemerides (best accuracy, ~20 days delay)
    POEORB,
    /// Restituted Orbit Ephemerides (lower accuracy, ~3 hours delay)
    RESORB,
}

impl std::fmt::Display for OrbitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrbitType::POEORB => write!(f, "POEORB"),
            OrbitType::RESORB => write!(f, "RESORB"),
        }
    }
}

impl OrbitType {
    /// POEORB once the acquisition is more than 20 days old
    pub fn for_acquisition(acquisition: DateTime<Utc>, now: DateTime<Utc>) -> OrbitType {
        if (now - acquisition).num_days() > 20 {
            OrbitType::POEORB
        } else {
            OrbitType::RESORB
        }
    }
}

/// Mission and sensing start of a Sentinel-1 SLC product
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S1Product {
    pub name: String,
    /// `S1A`, `S1B` or `S1C`
    pub mission: String,
    pub start_time: DateTime<Utc>,
}

fn product_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(S1[ABC])_(IW|EW|SM|S[1-6])_SLC__1S[SD][VH]_(\d{8}T\d{6})_\d{8}T\d{6}_")
            .unwrap()
    })
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href="([^"/]+\.EOF(?:\.zip)?)""#).unwrap())
}

fn parse_compact_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S")
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}

/// Parse an S1 product file name (path, `.zip` and `.SAFE` allowed)
pub fn parse_product_name(path: &str) -> MinsarResult<S1Product> {
    let name = Path::new(path.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let caps = product_regex().captures(&name).ok_or_else(|| {
        MinsarError::InvalidFormat(format!("'{}' is not a Sentinel-1 SLC product name", name))
    })?;
    let start_time = parse_compact_time(&caps[3]).ok_or_else(|| {
        MinsarError::InvalidFormat(format!("bad sensing time in '{}'", name))
    })?;

    Ok(S1Product {
        mission: caps[1].to_string(),
        start_time,
        name,
    })
}

/// Orbit file name with its validity window.
///
/// Format: `S1A_OPER_AUX_POEORB_OPOD_<production>_V<start>_<stop>.EOF[.zip]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrbitFile {
    pub name: String,
    pub mission: String,
    pub orbit_type: OrbitType,
    pub validity_start: DateTime<Utc>,
    pub validity_stop: DateTime<Utc>,
}

impl OrbitFile {
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.trim_end_matches(".zip").trim_end_matches(".EOF");
        let parts: Vec<&str> = stem.split('_').collect();
        if parts.len() != 8 || parts[1] != "OPER" || parts[2] != "AUX" {
            return None;
        }
        let orbit_type = match parts[3] {
            "POEORB" => OrbitType::POEORB,
            "RESORB" => OrbitType::RESORB,
            _ => return None,
        };
        let validity_start = parse_compact_time(parts[6].strip_prefix('V')?)?;
        let validity_stop = parse_compact_time(parts[7])?;

        Some(Self {
            name: name.to_string(),
            mission: parts[0].to_string(),
            orbit_type,
            validity_start,
            validity_stop,
        })
    }

    /// Whether `time` lies inside the validity window
    pub fn covers(&self, time: DateTime<Utc>) -> bool {
        self.validity_start <= time && time <= self.validity_stop
    }

    /// Distance between the window centre and `time` (lower is better)
    pub fn score(&self, time: DateTime<Utc>) -> i64 {
        let centre = self.validity_start + (self.validity_stop - self.validity_start) / 2;
        (time - centre).num_seconds().abs()
    }

    /// File name once extracted from its zip
    pub fn eof_name(&self) -> String {
        self.name.trim_end_matches(".zip").to_string()
    }
}

/// Names of `.EOF` / `.EOF.zip` links in an HTML directory listing
pub fn extract_links(html: &str) -> Vec<String> {
    let mut names: Vec<String> = link_regex()
        .captures_iter(html)
        .map(|c| c[1].to_string())
        .collect();
    names.dedup();
    names
}

/// Files of `listing` usable for the product, best first
pub fn select_orbit_files(
    listing: &[String],
    product: &S1Product,
    orbit_type: OrbitType,
) -> Vec<OrbitFile> {
    let mut files: Vec<OrbitFile> = listing
        .iter()
        .filter_map(|name| OrbitFile::parse(name))
        .filter(|f| f.orbit_type == orbit_type)
        .filter(|f| f.mission == product.mission)
        .filter(|f| f.covers(product.start_time))
        .collect();
    files.sort_by_key(|f| f.score(product.start_time));
    files
}

/// Check if content is a ZIP file by examining magic bytes
fn is_zip_content(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == [0x50, 0x4B, 0x03, 0x04]
}

/// Extract the `.EOF` member of a zipped orbit file
pub fn extract_eof_from_zip(zip_bytes: &[u8]) -> MinsarResult<String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| MinsarError::Download(format!("Failed to read ZIP archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| MinsarError::Download(format!("Failed to read ZIP entry {}: {}", i, e)))?;

        if file.name().ends_with(".EOF") {
            log::debug!("Found EOF file in ZIP: {}", file.name());
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(MinsarError::Download("No .EOF file found in ZIP archive".to_string()))
}

/// Locally stored orbit files, looked up by validity window
#[derive(Debug, Clone)]
pub struct OrbitCache {
    cache_dir: PathBuf,
}

impl OrbitCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cached file of the given type covering the product start
    pub fn find(&self, product: &S1Product, orbit_type: OrbitType) -> MinsarResult<Option<PathBuf>> {
        if !self.cache_dir.is_dir() {
            return Ok(None);
        }
        let listing: Vec<String> = fs::read_dir(&self.cache_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".EOF"))
            .collect();

        Ok(select_orbit_files(&listing, product, orbit_type)
            .first()
            .map(|f| self.cache_dir.join(&f.name)))
    }

    /// Write an orbit file atomically into the cache
    pub fn store(&self, name: &str, content: &str) -> MinsarResult<PathBuf> {
        fs::create_dir_all(&self.cache_dir)?;
        let path = self.cache_dir.join(name);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&path).map_err(|e| MinsarError::Io(e.error))?;

        log::info!("Orbit file saved to: {}", path.display());
        Ok(path)
    }
}

/// Finds and downloads Sentinel-1 orbit files from the ESA STEP server
pub struct OrbitDownloader {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl OrbitDownloader {
    pub fn new() -> MinsarResult<Self> {
        Self::with_base_url(ESA_STEP_ORBIT_URL)
    }

    pub fn with_base_url(base_url: &str) -> MinsarResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| MinsarError::Download(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Monthly directories around the acquisition (a day either side)
    pub fn directory_urls(&self, product: &S1Product, orbit_type: OrbitType) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for offset in [-1, 0, 1] {
            let date = product.start_time + Duration::days(offset);
            let url = format!(
                "{}/{}/{}/{}/",
                self.base_url,
                orbit_type,
                product.mission,
                date.format("%Y/%m")
            );
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    fn get(&self, url: &str) -> MinsarResult<reqwest::blocking::Response> {
        log::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| MinsarError::Download(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(MinsarError::Download(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        Ok(response)
    }

    /// Candidate orbit file URLs, best first
    pub fn find_orbit_urls(
        &self,
        product: &S1Product,
        orbit_type: OrbitType,
    ) -> MinsarResult<Vec<(String, OrbitFile)>> {
        let mut candidates = Vec::new();

        for dir_url in self.directory_urls(product, orbit_type) {
            log::debug!("Checking directory: {}", dir_url);
            let html = match self.get(&dir_url).and_then(|r| {
                r.text()
                    .map_err(|e| MinsarError::Download(format!("Failed to read listing: {}", e)))
            }) {
                Ok(html) => html,
                Err(e) => {
                    log::warn!("Directory listing {} failed: {}", dir_url, e);
                    continue;
                }
            };

            for file in select_orbit_files(&extract_links(&html), product, orbit_type) {
                candidates.push((format!("{}{}", dir_url, file.name), file));
            }
        }

        candidates.sort_by_key(|(_, f)| f.score(product.start_time));
        log::info!(
            "Found {} {} candidates for {}",
            candidates.len(),
            orbit_type,
            product.name
        );
        Ok(candidates)
    }

    /// Download one orbit file and return its EOF text
    pub fn download(&self, url: &str) -> MinsarResult<String> {
        let bytes = self
            .get(url)?
            .bytes()
            .map_err(|e| MinsarError::Download(format!("Failed to read response bytes: {}", e)))?;

        if url.ends_with(".zip") || is_zip_content(&bytes) {
            log::debug!("Processing ZIP file from: {}", url);
            extract_eof_from_zip(&bytes)
        } else {
            String::from_utf8(bytes.to_vec())
                .map_err(|e| MinsarError::Download(format!("Invalid UTF-8 content: {}", e)))
        }
    }
}

/// Cache-first orbit retrieval with POEORB -> RESORB fallback
pub struct OrbitManager {
    cache: OrbitCache,
    downloader: OrbitDownloader,
}

impl OrbitManager {
    pub fn new(cache: OrbitCache, downloader: OrbitDownloader) -> Self {
        Self { cache, downloader }
    }

    pub fn cache(&self) -> &OrbitCache {
        &self.cache
    }

    fn fetch_type(&self, product: &S1Product, orbit_type: OrbitType) -> MinsarResult<PathBuf> {
        if let Some(path) = self.cache.find(product, orbit_type)? {
            log::info!("Using cached orbit file: {}", path.display());
            return Ok(path);
        }

        let candidates = self.downloader.find_orbit_urls(product, orbit_type)?;
        for (i, (url, file)) in candidates.iter().enumerate() {
            log::info!("Attempting download {}/{}: {}", i + 1, candidates.len(), url);
            match self.downloader.download(url) {
                Ok(content) => return self.cache.store(&file.eof_name(), &content),
                Err(e) => log::warn!("Failed to download from {}: {}", url, e),
            }
        }

        Err(MinsarError::Download(format!(
            "no {} orbit file available for {}",
            orbit_type, product.name
        )))
    }

    /// Path of an orbit file covering the product
    pub fn orbit_for_product(&self, product: &S1Product, now: DateTime<Utc>) -> MinsarResult<PathBuf> {
        let orbit_type = OrbitType::for_acquisition(product.start_time, now);
        log::info!("Selected orbit type {} for {}", orbit_type, product.name);

        match self.fetch_type(product, orbit_type) {
            Ok(path) => Ok(path),
            Err(e) if orbit_type == OrbitType::POEORB => {
                log::warn!("POEORB retrieval failed: {}. Falling back to RESORB", e);
                self.fetch_type(product, OrbitType::RESORB)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const PRODUCT: &str =
        "S1A_IW_SLC__1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE.zip";
    const POEORB: &str =
        "S1A_OPER_AUX_POEORB_OPOD_20200123T121053_V20200102T225942_20200104T005942.EOF";

    #[test]
    fn test_parse_product_name() {
        let product = parse_product_name(&format!("/data/SLC/{}", PRODUCT)).unwrap();
        assert_eq!(product.mission, "S1A");
        assert_eq!(product.start_time, Utc.with_ymd_and_hms(2020, 1, 3, 17, 8, 15).unwrap());
        assert!(parse_product_name("TSX1_SAR__SSC______SM_S_SRA_20200103T170815").is_err());
    }

    #[test]
    fn test_orbit_type_by_age() {
        let acq = Utc.with_ymd_and_hms(2020, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(OrbitType::for_acquisition(acq, acq + Duration::days(30)), OrbitType::POEORB);
        assert_eq!(OrbitType::for_acquisition(acq, acq + Duration::days(2)), OrbitType::RESORB);
    }

    #[test]
    fn test_orbit_file_window() {
        let file = OrbitFile::parse(&format!("{}.zip", POEORB)).unwrap();
        assert_eq!(file.orbit_type, OrbitType::POEORB);
        assert_eq!(file.mission, "S1A");
        assert_eq!(file.eof_name(), POEORB);

        let product = parse_product_name(PRODUCT).unwrap();
        assert!(file.covers(product.start_time));
        assert!(!file.covers(product.start_time + Duration::days(2)));
        assert!(OrbitFile::parse("S1A_IW_SLC__1SDV.zip").is_none());
    }

    #[test]
    fn test_listing_selection_prefers_centred_window() {
        let html = format!(
            r#"<a href="../">../</a>
<a href="{poe}.zip">{poe}.zip</a>
<a href="S1A_OPER_AUX_POEORB_OPOD_20200124T121053_V20200103T000000_20200104T235959.EOF.zip">x</a>
<a href="S1B_OPER_AUX_POEORB_OPOD_20200123T121053_V20200102T225942_20200104T005942.EOF.zip">y</a>
<a href="S1A_OPER_AUX_POEORB_OPOD_20200110T121053_V20191230T225942_20200101T005942.EOF.zip">z</a>"#,
            poe = POEORB
        );
        let links = extract_links(&html);
        assert_eq!(links.len(), 4);

        let product = parse_product_name(PRODUCT).unwrap();
        let selected = select_orbit_files(&links, &product, OrbitType::POEORB);
        assert_eq!(selected.len(), 2);
        // 17:08:15 is 5h08m from the first window centre and 6h51m from the second
        assert_eq!(selected[0].name, format!("{}.zip", POEORB));
        assert!(select_orbit_files(&links, &product, OrbitType::RESORB).is_empty());
    }

    #[test]
    fn test_directory_urls_cover_neighbouring_month() {
        let downloader = OrbitDownloader::with_base_url("https://example.org/orbits/").unwrap();
        let product = S1Product {
            name: "p".to_string(),
            mission: "S1B".to_string(),
            start_time: Utc.with_ymd_and_hms(2021, 3, 31, 12, 0, 0).unwrap(),
        };
        let urls = downloader.directory_urls(&product, OrbitType::POEORB);
        assert_eq!(
            urls,
            vec![
                "https://example.org/orbits/POEORB/S1B/2021/03/".to_string(),
                "https://example.org/orbits/POEORB/S1B/2021/04/".to_string(),
            ]
        );
    }

    #[test]
    fn test_zip_extraction() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file(POEORB, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(b"<Earth_Explorer_File/>").unwrap();
            writer.finish().unwrap();
        }
        let bytes = buffer.into_inner();
        assert!(is_zip_content(&bytes));
        assert_eq!(extract_eof_from_zip(&bytes).unwrap(), "<Earth_Explorer_File/>");
    }

    #[test]
    fn test_cache_store_and_find() {
        let dir = TempDir::new().unwrap();
        let cache = OrbitCache::new(dir.path().join("orbits"));
        let product = parse_product_name(PRODUCT).unwrap();

        assert!(cache.find(&product, OrbitType::POEORB).unwrap().is_none());
        let stored = cache.store(POEORB, "<Earth_Explorer_File/>").unwrap();
        assert_eq!(cache.find(&product, OrbitType::POEORB).unwrap(), Some(stored));
        assert!(cache.find(&product, OrbitType::RESORB).unwrap().is_none());
    }
}
