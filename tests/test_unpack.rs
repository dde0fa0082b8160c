use flate2::write::GzEncoder;
use flate2::Compression;
use minsar::core::registry::SatelliteRegistry;
use minsar::io::command::{CommandOutput, CommandRunner, CommandSpec, DryRunner};
use minsar::io::unpack::{extract_zip, Unpacker, UNPACKED_MARKER};
use minsar::MinsarResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;
use zip::write::FileOptions;

#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
}

impl CommandRunner for RecordingRunner {
    fn run(&self, spec: &CommandSpec) -> MinsarResult<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok(CommandOutput::default())
    }
}

/// Stands in for tar by writing one file into the `-C` directory
struct FakeTar;

impl CommandRunner for FakeTar {
    fn run(&self, spec: &CommandSpec) -> MinsarResult<CommandOutput> {
        if spec.program == "tar" {
            fs::write(Path::new(&spec.args[3]).join("IMAGE_HH.cos"), b"payload")?;
        }
        Ok(CommandOutput::default())
    }
}

fn init() -> &'static SatelliteRegistry {
    let _ = env_logger::builder().is_test(true).try_init();
    SatelliteRegistry::builtin().unwrap()
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

#[test]
fn test_unpack_tsx_delivery() {
    let registry = init();
    let tsx = registry.resolve_alias("Tsx").unwrap();
    let project = TempDir::new().unwrap();
    let raw = project.path().join("RAW_data");
    fs::create_dir_all(&raw).unwrap();

    write_zip(
        &raw.join("dims_op_oc_dfd2_372064029_1.zip"),
        &[
            ("TSX-1.SAR.L1B/TSX1_SAR__SSC_20100101/TSX1_SAR__SSC_20100101.xml", "<level1Product/>"),
            ("TSX-1.SAR.L1B/TSX1_SAR__SSC_20100101/IMAGEDATA/IMAGE_HH_SRA_strip_005.cos", "cos"),
        ],
    );
    fs::write(raw.join("notes.txt"), "not an archive").unwrap();

    let runner = RecordingRunner::default();
    let unpacker = Unpacker::new(tsx, &runner, project.path());
    assert_eq!(unpacker.pending_archives().unwrap().len(), 1);

    let report = unpacker.unpack_all().unwrap();
    assert!(report.is_success());
    assert_eq!(report.extracted, vec![raw.join("dims_op_oc_dfd2_372064029_1")]);
    assert!(raw
        .join("dims_op_oc_dfd2_372064029_1/TSX-1.SAR.L1B/TSX1_SAR__SSC_20100101/IMAGEDATA/IMAGE_HH_SRA_strip_005.cos")
        .is_file());
    assert!(project.path().join("SLC").is_dir());

    let prep = report.prep_command.expect("prep command");
    assert_eq!(prep.program, "prepSlcTSX.py");
    assert_eq!(
        prep.args,
        vec![
            "-i".to_string(),
            raw.to_string_lossy().into_owned(),
            "-o".to_string(),
            project.path().join("SLC").to_string_lossy().into_owned(),
        ]
    );
    assert_eq!(runner.calls.lock().unwrap().len(), 1);

    // a second run reuses the extracted directory
    let again = unpacker.unpack_all().unwrap();
    assert_eq!(again.extracted, report.extracted);
}

#[test]
fn test_gzip_and_tar_archives() {
    let registry = init();
    let csk = registry.resolve_alias("csk").unwrap();
    let project = TempDir::new().unwrap();
    let raw = project.path().join("RAW_data");
    fs::create_dir_all(&raw).unwrap();

    let mut gz = GzEncoder::new(
        File::create(raw.join("CSKS1_SCS_B_HI_09_HH_RA_SF_20190101000000_20190101000007.h5.gz"))
            .unwrap(),
        Compression::default(),
    );
    gz.write_all(b"HDF5 payload").unwrap();
    gz.finish().unwrap();
    fs::write(raw.join("CSKS2_SCS_B_HI_09_HH_RA_SF_20190201000000_20190201000007.tar.gz"), b"")
        .unwrap();

    let runner = RecordingRunner::default();
    let report = Unpacker::new(csk, &runner, project.path()).unpack_all().unwrap();
    assert!(report.is_success());
    assert_eq!(report.extracted.len(), 2);

    let h5 = raw
        .join("CSKS1_SCS_B_HI_09_HH_RA_SF_20190101000000_20190101000007.h5")
        .join("CSKS1_SCS_B_HI_09_HH_RA_SF_20190101000000_20190101000007.h5");
    assert_eq!(fs::read(h5).unwrap(), b"HDF5 payload");

    let calls = runner.calls.lock().unwrap();
    let tar = calls.iter().find(|c| c.program == "tar").expect("tar call");
    assert_eq!(tar.args[0], "-xzf");
    assert!(tar.args[1].ends_with(".tar.gz"));
    assert_eq!(tar.args[2], "-C");
    assert!(calls.iter().any(|c| c.program == "prepSlcSensors.py"));
}

#[test]
fn test_zip_entries_cannot_escape() {
    init();
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("evil.zip");
    write_zip(&archive, &[("ok/file.txt", "fine"), ("../../escape.txt", "bad")]);

    let dest = dir.path().join("out");
    fs::create_dir(&dest).unwrap();
    assert!(extract_zip(&archive, &dest).is_err());
    assert!(!dir.path().join("escape.txt").exists());
}

#[test]
fn test_failed_archive_blocks_preparation() {
    let registry = init();
    let alos2 = registry.resolve_alias("Alos2").unwrap();
    let project = TempDir::new().unwrap();
    let raw = project.path().join("RAW_data");
    fs::create_dir_all(&raw).unwrap();
    fs::write(raw.join("0000230036_001001_ALOS2227337160-180808.zip"), b"not a zip").unwrap();

    let runner = RecordingRunner::default();
    let report = Unpacker::new(alos2, &runner, project.path()).unpack_all().unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert!(report.prep_command.is_none());
    assert!(runner.calls.lock().unwrap().is_empty());
    assert!(!raw.join("0000230036_001001_ALOS2227337160-180808").exists());
}

#[test]
fn test_sentinel1_needs_no_unpacking() {
    let registry = init();
    let s1 = registry.resolve_alias("Sen").unwrap();
    let project = TempDir::new().unwrap();
    fs::create_dir_all(project.path().join("SLC")).unwrap();
    fs::write(
        project.path().join("SLC/S1A_IW_SLC__1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE.zip"),
        b"",
    )
    .unwrap();

    let report = Unpacker::new(s1, &DryRunner, project.path()).unpack_all().unwrap();
    assert!(report.extracted.is_empty());
    assert!(report.prep_command.is_none());
}

#[test]
fn test_dry_run_leaves_delivery_untouched() {
    let registry = init();
    let tsx = registry.resolve_alias("tsx").unwrap();
    let project = TempDir::new().unwrap();
    let raw = project.path().join("RAW_data");
    fs::create_dir_all(&raw).unwrap();
    fs::write(raw.join("dims_op_oc_dfd2_1.tar.gz"), b"").unwrap();
    write_zip(&raw.join("dims_op_oc_dfd2_2.zip"), &[("TSX-1.SAR.L1B/a.xml", "<a/>")]);

    let dry = Unpacker::new(tsx, &DryRunner, project.path()).unpack_all().unwrap();
    assert_eq!(dry.extracted.len(), 2);
    let mut entries: Vec<String> = fs::read_dir(&raw)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["dims_op_oc_dfd2_1.tar.gz", "dims_op_oc_dfd2_2.zip"]);
    assert!(!project.path().join("SLC").exists());

    // the real run afterwards still extracts everything
    let report = Unpacker::new(tsx, &FakeTar, project.path()).unpack_all().unwrap();
    assert!(report.is_success());
    assert_eq!(fs::read(raw.join("dims_op_oc_dfd2_1/IMAGE_HH.cos")).unwrap(), b"payload");
    assert!(raw.join("dims_op_oc_dfd2_2/TSX-1.SAR.L1B/a.xml").is_file());
    assert!(raw.join("dims_op_oc_dfd2_1").join(UNPACKED_MARKER).is_file());
}

#[test]
fn test_incomplete_directory_is_extracted_again() {
    let registry = init();
    let tsx = registry.resolve_alias("tsx").unwrap();
    let project = TempDir::new().unwrap();
    let raw = project.path().join("RAW_data");
    fs::create_dir_all(raw.join("dims_op_oc_dfd2_1")).unwrap();
    fs::write(raw.join("dims_op_oc_dfd2_1.tar.gz"), b"").unwrap();

    let unpacker = Unpacker::new(tsx, &FakeTar, project.path());
    let dir = unpacker.extract(&raw.join("dims_op_oc_dfd2_1.tar.gz")).unwrap();
    assert_eq!(dir, raw.join("dims_op_oc_dfd2_1"));
    assert!(dir.join("IMAGE_HH.cos").is_file());
    assert!(dir.join(UNPACKED_MARKER).is_file());
}
