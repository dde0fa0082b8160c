//! minsar CLI - satellite dispatch and job orchestration

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use minsar::core::jobs::JobBuilder;
use minsar::core::registry::{SatelliteConfig, SatelliteRegistry};
use minsar::core::scheduler::scheduler_for;
use minsar::core::throttle::{Throttle, ThrottleConfig};
use minsar::io::command::{CommandRunner, DryRunner, SystemRunner};
use minsar::io::download::DownloadRequest;
use minsar::io::manifest::detect_product;
use minsar::io::orbit::{parse_product_name, OrbitCache, OrbitDownloader, OrbitManager};
use minsar::io::project::ProjectName;
use minsar::io::queue_config::{JobDefaults, QueueSpec, QueueTable};
use minsar::io::template::Template;
use minsar::io::unpack::Unpacker;
use minsar::Settings;

#[derive(Parser)]
#[command(name = "minsar")]
#[command(author, version, about = "Satellite dispatch and job orchestration for InSAR processing", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the supported satellites
    Satellites {
        /// Print the registry as JSON
        #[arg(long)]
        json: bool,
    },
    /// Detect the satellite of templates, product files, platforms or aliases
    Detect {
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// Download the data a template describes
    Download {
        template: PathBuf,
        /// Download method (ssara, asf, burst, manual); satellite default if omitted
        #[arg(short, long)]
        method: Option<String>,
        /// Print the command instead of running it
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch Sentinel-1 orbit files for products
    Orbits {
        #[arg(required = true)]
        products: Vec<PathBuf>,
        /// Orbit cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Unpack delivered archives and prepare SLCs
    Unpack {
        template: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Write job files for run files
    Jobs {
        #[arg(required = true)]
        run_files: Vec<PathBuf>,
        #[command(flatten)]
        job_args: JobArgs,
    },
    /// Write job files and submit run files step by step
    Submit {
        #[arg(required = true)]
        run_files: Vec<PathBuf>,
        #[command(flatten)]
        job_args: JobArgs,
        /// Seconds between queue polls
        #[arg(long, default_value = "60")]
        poll: u64,
        /// Resubmissions allowed per timed out job
        #[arg(long, default_value = "1")]
        max_resubmits: usize,
        /// Write the job files but do not submit
        #[arg(long)]
        dry_run: bool,
    },
    /// Show what a template resolves to, optionally merged with defaults
    Template {
        template: PathBuf,
        /// Defaults template filling missing and `auto` keys
        #[arg(short, long)]
        defaults: Option<PathBuf>,
        /// Write the merged template here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct JobArgs {
    /// Queue name (QUEUENAME, else the platform's first queue)
    #[arg(short, long)]
    queue: Option<String>,
    /// Allocation charged for the jobs
    #[arg(short = 'A', long)]
    account: Option<String>,
    /// Add memory requests to job headers
    #[arg(long)]
    memory: bool,
    /// Cap on tasks per job
    #[arg(long)]
    max_tasks_per_job: Option<usize>,
    /// Directory for job files (next to the run files by default)
    #[arg(short, long)]
    out_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let registry = SatelliteRegistry::builtin().context("built-in satellite table is invalid")?;

    match cli.command {
        Commands::Satellites { json } => list_satellites(registry, json),
        Commands::Detect { inputs } => detect(registry, &inputs),
        Commands::Download {
            template,
            method,
            dry_run,
        } => download(registry, &template, method.as_deref(), dry_run),
        Commands::Orbits {
            products,
            cache_dir,
        } => orbits(&products, cache_dir),
        Commands::Unpack { template, dry_run } => unpack(registry, &template, dry_run),
        Commands::Jobs {
            run_files,
            job_args,
        } => {
            let settings = Settings::from_env()?;
            let (queue, defaults) = load_queue(&settings, job_args.queue.as_deref())?;
            for run_file in &run_files {
                let jobs = job_builder(&settings, &queue, &defaults, &job_args)
                    .write_jobs(run_file, job_args.out_dir.as_deref())?;
                for job in jobs {
                    println!("{}", job.path.display());
                }
            }
            Ok(())
        }
        Commands::Submit {
            run_files,
            job_args,
            poll,
            max_resubmits,
            dry_run,
        } => submit(&run_files, &job_args, poll, max_resubmits, dry_run),
        Commands::Template {
            template,
            defaults,
            output,
        } => show_template(registry, &template, defaults.as_deref(), output.as_deref()),
    }
}

fn runner(dry_run: bool) -> Box<dyn CommandRunner> {
    if dry_run {
        Box::new(DryRunner)
    } else {
        Box::new(SystemRunner)
    }
}

fn list_satellites(registry: &SatelliteRegistry, json: bool) -> Result<()> {
    if json {
        let all: Vec<&SatelliteConfig> = registry.iter().collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    println!(
        "{:<12} {:<6} {:<14} {:<8} {:<18} {:<12} {}",
        "ID", "ABBR", "STACK", "DEFAULT", "ALLOWED", "UNPACK", "ORBITS"
    );
    for sat in registry.iter() {
        let allowed: Vec<&str> = sat.download_allowed.iter().map(|m| m.as_str()).collect();
        println!(
            "{:<12} {:<6} {:<14} {:<8} {:<18} {:<12} {}",
            sat.id,
            sat.abbreviation,
            sat.stack.to_string(),
            sat.download_default.as_str(),
            allowed.join(","),
            sat.unpack.to_string(),
            if sat.needs_orbit_download { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn detect_one<'r>(registry: &'r SatelliteRegistry, input: &str) -> Result<&'r SatelliteConfig> {
    let path = Path::new(input);
    if path.is_file() && input.ends_with(".template") {
        let template = Template::read(path)?;
        return Ok(registry.detect_from_template(&template)?);
    }
    if path.exists() {
        return Ok(detect_product(registry, path)?);
    }
    if let Some(sat) = registry.resolve_alias(input) {
        return Ok(sat);
    }
    if let Ok(sat) = registry.detect_from_platform(input) {
        return Ok(sat);
    }
    registry
        .detect_from_filename(input)
        .with_context(|| format!("no satellite matches '{}'", input))
}

fn detect(registry: &SatelliteRegistry, inputs: &[String]) -> Result<()> {
    let mut failures = 0;
    for input in inputs {
        match detect_one(registry, input) {
            Ok(sat) => println!("{}\t{}", input, sat.id),
            Err(e) => {
                log::error!("{}: {:#}", input, e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{} of {} inputs could not be detected", failures, inputs.len());
    }
    Ok(())
}

/// Template plus the project directory it works in
fn project(template_path: &Path) -> Result<(Template, PathBuf)> {
    let template = Template::read(template_path)
        .with_context(|| format!("reading template {}", template_path.display()))?;
    let project = template
        .project()
        .context("template file has no name to take the project from")?
        .to_string();
    let settings = Settings::from_env()?;
    Ok((template, settings.project_dir(&project)))
}

fn download(
    registry: &SatelliteRegistry,
    template_path: &Path,
    method: Option<&str>,
    dry_run: bool,
) -> Result<()> {
    let (template, project_dir) = project(template_path)?;
    let request = DownloadRequest::from_template(registry, &template, method, &project_dir)?;
    request.run(runner(dry_run).as_ref())?;
    Ok(())
}

fn orbits(products: &[PathBuf], cache_dir: Option<PathBuf>) -> Result<()> {
    let cache_dir = match cache_dir {
        Some(dir) => dir,
        None => Settings::from_env()?.orbit_cache_dir(),
    };
    let manager = OrbitManager::new(OrbitCache::new(cache_dir), OrbitDownloader::new()?);
    let now = Utc::now();

    for path in products {
        let product = parse_product_name(&path.to_string_lossy())?;
        let orbit = manager
            .orbit_for_product(&product, now)
            .with_context(|| format!("no orbit for {}", product.name))?;
        println!("{}\t{}", product.name, orbit.display());
    }
    Ok(())
}

fn unpack(registry: &SatelliteRegistry, template_path: &Path, dry_run: bool) -> Result<()> {
    let (template, project_dir) = project(template_path)?;
    let satellite = registry.detect_from_template(&template)?;
    let runner = runner(dry_run);
    let report = Unpacker::new(satellite, runner.as_ref(), &project_dir).unpack_all()?;

    for dir in &report.extracted {
        println!("{}", dir.display());
    }
    if !report.is_success() {
        for (archive, error) in &report.failed {
            log::error!("{}: {}", archive.display(), error);
        }
        bail!("{} archives failed to unpack", report.failed.len());
    }
    Ok(())
}

fn load_queue(settings: &Settings, queue: Option<&str>) -> Result<(QueueSpec, JobDefaults)> {
    let queues_file = settings.queues_file()?;
    let table = QueueTable::read(&queues_file)
        .with_context(|| format!("reading {}", queues_file.display()))?;
    let queue = table
        .find(
            settings.require_platform()?,
            queue.or(settings.queue.as_deref()),
        )?
        .clone();

    let defaults_file = settings.job_defaults_file()?;
    let defaults = JobDefaults::read(&defaults_file)
        .with_context(|| format!("reading {}", defaults_file.display()))?;
    Ok((queue, defaults))
}

fn job_builder<'a>(
    settings: &Settings,
    queue: &'a QueueSpec,
    defaults: &'a JobDefaults,
    args: &JobArgs,
) -> JobBuilder<'a> {
    let mut builder = JobBuilder::new(settings.scheduler, queue, defaults).request_memory(args.memory);
    if let Some(account) = &args.account {
        builder = builder.account(account.clone());
    }
    if let Some(max) = args.max_tasks_per_job {
        builder = builder.max_tasks_per_job(max);
    }
    builder
}

fn submit(
    run_files: &[PathBuf],
    args: &JobArgs,
    poll: u64,
    max_resubmits: usize,
    dry_run: bool,
) -> Result<()> {
    let settings = Settings::from_env()?;
    let (queue, defaults) = load_queue(&settings, args.queue.as_deref())?;
    let builder = job_builder(&settings, &queue, &defaults, args);

    let runner = SystemRunner;
    let scheduler = scheduler_for(settings.scheduler, &runner);
    let mut config = ThrottleConfig::from_queue(&queue);
    config.poll_interval = Duration::from_secs(poll);
    config.max_resubmits = max_resubmits;
    let throttle = Throttle::new(
        scheduler.as_ref(),
        settings.user.clone(),
        config,
        &settings.throttle_dir(),
    );

    for run_file in run_files {
        let jobs = builder.write_jobs(run_file, args.out_dir.as_deref())?;
        if jobs.is_empty() {
            continue;
        }
        if dry_run {
            for job in &jobs {
                println!("{}", job.path.display());
            }
            continue;
        }

        log::info!("Running {} ({} jobs)", run_file.display(), jobs.len());
        let report = throttle
            .run_step(&jobs)
            .with_context(|| format!("step {} failed", run_file.display()))?;
        let resubmitted = report.outcomes.iter().filter(|o| o.resubmits > 0).count();
        log::info!(
            "{} finished: {} jobs, {} resubmitted",
            run_file.display(),
            report.outcomes.len(),
            resubmitted
        );
    }
    Ok(())
}

fn show_template(
    registry: &SatelliteRegistry,
    template_path: &Path,
    defaults: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let mut template = Template::read(template_path)?;
    if let Some(defaults) = defaults {
        template.merge_defaults(&Template::read(defaults)?);
    }

    if let Some(project) = template.project() {
        match ProjectName::parse(project) {
            Ok(name) => println!(
                "project    {} (region {}, {} track {})",
                name.name,
                name.region,
                name.direction,
                name.track
            ),
            Err(e) => log::warn!("{}", e),
        }
    }

    let satellite = registry.detect_from_template(&template)?;
    let method = registry.validate_download_method(
        satellite,
        template.get_explicit("minsar.download_method"),
    )?;
    println!("satellite  {} ({})", satellite.id, satellite.name);
    println!("stack      {}", satellite.stack);
    println!("download   {} -> {}/", method, satellite.layout.download_dir);
    println!("unpack     {}", satellite.unpack);

    match output {
        Some(path) => {
            template.write(path)?;
            log::info!("Wrote {}", path.display());
        }
        None if defaults.is_some() => print!("{}", template.render()),
        None => {}
    }
    Ok(())
}
