use chrono::{Duration, TimeZone, Utc};
use minsar::io::orbit::{
    parse_product_name, OrbitCache, OrbitDownloader, OrbitManager, OrbitType,
};
use tempfile::TempDir;

const PRODUCT: &str = "S1B_IW_SLC__1SDV_20210306T020452_20210306T020519_025900_0316A6_8F1C.zip";
const POEORB: &str =
    "S1B_OPER_AUX_POEORB_OPOD_20210326T111552_V20210305T225942_20210307T005942.EOF";
const RESORB: &str =
    "S1B_OPER_AUX_RESORB_OPOD_20210306T050311_V20210306T011243_20210306T043013.EOF";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Downloader pointing at a port nothing listens on
fn offline() -> OrbitDownloader {
    OrbitDownloader::with_base_url("http://127.0.0.1:9/orbits").unwrap()
}

#[test]
fn test_cached_precise_orbit_is_used() {
    init();
    let dir = TempDir::new().unwrap();
    let cache = OrbitCache::new(dir.path());
    let cached = cache.store(POEORB, "<Earth_Explorer_File/>").unwrap();
    cache.store(RESORB, "<Earth_Explorer_File/>").unwrap();

    let product = parse_product_name(PRODUCT).unwrap();
    let manager = OrbitManager::new(cache, offline());
    let now = product.start_time + Duration::days(60);

    let orbit = manager.orbit_for_product(&product, now).unwrap();
    println!("Using {}", orbit.display());
    assert_eq!(orbit, cached);
}

#[test]
fn test_falls_back_to_restituted_orbit() {
    init();
    let dir = TempDir::new().unwrap();
    let cache = OrbitCache::new(dir.path());
    let resorb = cache.store(RESORB, "<Earth_Explorer_File/>").unwrap();

    let product = parse_product_name(PRODUCT).unwrap();
    let manager = OrbitManager::new(cache, offline());
    let now = Utc.with_ymd_and_hms(2021, 5, 1, 0, 0, 0).unwrap();
    assert_eq!(OrbitType::for_acquisition(product.start_time, now), OrbitType::POEORB);

    assert_eq!(manager.orbit_for_product(&product, now).unwrap(), resorb);
}

#[test]
fn test_missing_orbit_is_an_error() {
    init();
    let dir = TempDir::new().unwrap();
    let product = parse_product_name(PRODUCT).unwrap();
    let manager = OrbitManager::new(OrbitCache::new(dir.path().join("empty")), offline());

    // a fresh acquisition only looks for RESORB, with no fallback
    let now = product.start_time + Duration::hours(6);
    assert!(manager.orbit_for_product(&product, now).is_err());
}
