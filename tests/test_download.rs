use approx::assert_relative_eq;
use minsar::core::registry::SatelliteRegistry;
use minsar::io::command::{CommandOutput, CommandRunner, CommandSpec, DryRunner};
use minsar::io::download::{BoundingBox, DownloadRequest};
use minsar::io::template::Template;
use minsar::{DownloadMethod, MinsarError, MinsarResult};
use std::path::{Path, PathBuf};

struct FailingRunner;

impl CommandRunner for FailingRunner {
    fn run(&self, _spec: &CommandSpec) -> MinsarResult<CommandOutput> {
        Ok(CommandOutput {
            status: 2,
            stdout: String::new(),
            stderr: "ERROR: no results\n".to_string(),
        })
    }
}

fn init() -> &'static SatelliteRegistry {
    let _ = env_logger::builder().is_test(true).try_init();
    SatelliteRegistry::builtin().unwrap()
}

#[test]
fn test_bounding_box_values() {
    let bbox = BoundingBox::parse_snwe("19.1, 19.6, -155.7 -155.0").unwrap();
    assert_relative_eq!(bbox.south, 19.1);
    assert_relative_eq!(bbox.north, 19.6);
    assert_relative_eq!(bbox.west, -155.7);
    assert_relative_eq!(bbox.east, -155.0);
    assert!(BoundingBox::parse_snwe("a b c d").is_err());
}

#[test]
fn test_stripmap_request_uses_ssara() {
    let registry = init();
    let template = Template::parse(
        "ssaraopt.platform       = TSX\n\
         ssaraopt.collectionName = Hawaii CSK,Hawaii TSX\n\
         ssaraopt.relativeOrbit  = 37\n\
         ssaraopt.startDate      = auto\n\
         stripmapStack.boundingBox = 19.1 19.6 -155.7 -155.0\n",
    )
    .unwrap()
    .with_project("MaunaLoaTsxAT37");

    let request =
        DownloadRequest::from_template(registry, &template, None, Path::new("/scratch/MaunaLoaTsxAT37"))
            .unwrap();
    assert_eq!(request.satellite, "TERRASARX");
    assert_eq!(request.method, DownloadMethod::Ssara);
    assert_eq!(request.start_date, None);
    assert_eq!(request.output_dir, PathBuf::from("/scratch/MaunaLoaTsxAT37/RAW_data"));

    let command = request.command().unwrap();
    assert_eq!(command.program, "ssara_federated_query.py");
    assert!(command.args.contains(&"--collectionName=Hawaii CSK,Hawaii TSX".to_string()));
    assert!(command
        .args
        .contains(&"--intersectsWith=POLYGON((-155.7 19.1,-155 19.1,-155 19.6,-155.7 19.6,-155.7 19.1))".to_string()));
    assert_eq!(command.current_dir, Some(request.output_dir.clone()));
}

#[test]
fn test_burst_request() {
    let registry = init();
    let template = Template::parse(
        "ssaraopt.platform = SENTINEL-1A\n\
         ssaraopt.relativeOrbit = 128\n\
         minsar.download_method = bursts\n",
    )
    .unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    let request = DownloadRequest::from_template(registry, &template, None, dir.path()).unwrap();
    assert_eq!(request.method, DownloadMethod::Burst);
    let command = request.command().unwrap();
    assert_eq!(command.args[0], "--product=BURST");

    // dry runs leave the project untouched
    request.run(&DryRunner).unwrap();
    assert!(!dir.path().join("SLC").exists());

    let err = request.run(&FailingRunner).unwrap_err();
    assert!(matches!(err, MinsarError::Download(ref msg) if msg.contains("no results")));
    assert!(dir.path().join("SLC").is_dir());
}

#[test]
fn test_manual_request_runs_nothing() {
    let registry = init();
    let template = Template::parse("ssaraopt.platform = RS2\n").unwrap();
    let dir = tempfile::TempDir::new().unwrap();

    let request = DownloadRequest::from_template(registry, &template, None, dir.path()).unwrap();
    assert_eq!(request.method, DownloadMethod::Manual);
    assert!(request.command().is_none());
    request.run(&FailingRunner).unwrap();

    assert!(DownloadRequest::from_template(registry, &template, Some("asf"), dir.path()).is_err());
}
