use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use picture_pipeline::output::{self, PictureReport};
use picture_pipeline::resizer::VipsThumbnail;
use picture_pipeline::{Pipeline, PipelineError, config, logging};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Release builds report the crate version, others the commit they came from.
fn version_string() -> &'static str {
    match (env!("ON_RELEASE_TAG"), env!("GIT_HASH")) {
        ("true", _) => env!("CARGO_PKG_VERSION"),
        (_, "") => "dev@unknown",
        _ => concat!("dev@", env!("GIT_HASH")),
    }
}

#[derive(Parser)]
#[command(name = "picture-pipeline")]
#[command(about = "Generate gallery derivatives (thumbnails, display and @2x images) with vipsthumbnail")]
#[command(long_about = "\
Generate gallery derivatives with vipsthumbnail

Each input file is stored as an original under a fresh key and four
variants are produced from it:

  images/
  ├── original/YYYY/MM/DD/<key>.<ext>
  ├── thumbnail/YYYY/MM/DD/<key>.<ext>       # 400px
  ├── thumbnail/YYYY/MM/DD/<key>@2x.<ext>    # 800px
  ├── processed/YYYY/MM/DD/<key>.<ext>       # 1024px
  └── processed/YYYY/MM/DD/<key>@2x.<ext>    # 2048px

Thumbnail, display and hi-res work run from separate queues so a backlog
of hi-res work never holds up thumbnails.

Run 'picture-pipeline gen-config' to generate a documented pipeline.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file (missing file = stock defaults)
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store originals and generate their variants
    Process(ProcessArgs),
    /// Validate the config file and print the effective settings
    CheckConfig,
    /// Print a stock pipeline.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct ProcessArgs {
    /// Image files to ingest
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Storage partition date (YYYY-MM-DD); defaults to today
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Seconds to wait for all pictures before reporting them as still running
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Process(args) => {
            let config = config::load_config(&cli.config)?;
            logging::init(&config.log)?;
            run_process(&config, &args)?;
        }
        Command::CheckConfig => {
            let config = config::load_config(&cli.config)?;
            let settings = config.pipeline_settings();
            println!("==> Config OK: {}", cli.config.display());
            println!("    Workers: {}", settings.workers);
            println!("    Queue capacity: {} per kind", settings.queue_capacity);
            println!("    Event buffer: {}", settings.event_buffer);
            println!("    Resizer: {}", config.resizer.program);
            println!(
                "    Sizes: {} / {} / {} / {}",
                settings.task.sizes.thumbnail,
                settings.task.sizes.processed,
                settings.task.sizes.thumbnail_hidpi,
                settings.task.sizes.processed_hidpi
            );
            println!("    Storage: {}", config.storage.root.display());
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn run_process(config: &config::Config, args: &ProcessArgs) -> Result<(), Box<dyn std::error::Error>> {
    let layout = config.storage_layout();
    let date = args.date.unwrap_or_else(|| Local::now().date_naive());
    layout.prepare(date)?;

    let resizer = Arc::new(VipsThumbnail::with_program(config.resizer.program.as_str()));
    let pipeline = Pipeline::new(config.pipeline_settings(), resizer);
    pipeline.start()?;

    let mut submitted = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let (picture, variants) = layout.allocate(extension_of(file), date);
        std::fs::copy(file, &picture.original)?;
        tracing::debug!(source = %file.display(), key = %picture.key, "original stored");
        let stored = picture.original.clone();
        let handle = pipeline.submit(picture, variants)?;
        submitted.push((file.clone(), stored, handle));
    }

    let timeout = Duration::from_secs(args.timeout);
    let deadline = Instant::now() + timeout;
    let mut reports = Vec::with_capacity(submitted.len());
    for (source, stored, handle) in submitted {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match handle.wait_timeout(remaining) {
            Ok(outcome) => Some(outcome),
            Err(PipelineError::TrackerTimeout { .. }) => None,
            Err(other) => return Err(other.into()),
        };
        reports.push(PictureReport {
            source,
            key: handle.key().to_string(),
            stored,
            outcome,
        });
    }

    let stats = pipeline.stats();
    if args.json {
        println!("{}", output::format_json(&reports, &stats)?);
    } else {
        output::print_reports(&reports, &stats, timeout);
    }

    if reports.iter().any(|r| r.outcome.is_none()) {
        tracing::warn!("waiting for pictures still running before exit");
    }
    pipeline.stop();

    let failed = reports.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        return Err(format!("{failed} picture(s) not fully processed").into());
    }
    Ok(())
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or_default()
}
