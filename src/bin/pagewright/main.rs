//! pagewright CLI tool
//!
//! ## Commands
//!
//! - `build`: One-shot build of the source tree into the destination tree
//! - `watch`: Build once, then rebuild whatever each batch of file changes affects
//!
//! Both commands build in debug mode (every asset linked directly) unless `--production` is
//! given, in which case assets are aggregated into minified, cache-busted bundles.

use clap::{Args, Parser, Subcommand};
use pagewright::{
    config::{BuildMode, BuildOptions, ProjectConfig, CONFIG_FILE_NAME},
    pipeline::{BuildReport, RebuildPipeline},
    watch::{ChangeFilter, WatchScheduler, WatchService},
};
use std::{path::PathBuf, sync::mpsc::channel};

#[derive(Parser)]
#[command(name = "pagewright")]
#[command(author, version, about = "An incremental static site builder", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the site once
    Build(SiteArgs),
    /// Build the site, then rebuild on every change until Ctrl-C
    Watch(SiteArgs),
}

#[derive(Args, Debug, Clone)]
struct SiteArgs {
    /// Source tree holding documents and assets
    #[arg(short, long, default_value = ".")]
    source: PathBuf,

    /// Destination tree for rendered documents and copied files
    #[arg(short, long, default_value = "build")]
    dest: PathBuf,

    /// Configuration file (default: <source>/pagewright.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Aggregate and minify assets into bundles
    #[arg(long)]
    production: bool,

    /// Ignore timestamps and rebuild everything
    #[arg(long)]
    full: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,

    /// Where bundles are written (default: <dest>/compiled)
    #[arg(long)]
    compile_dir: Option<PathBuf>,
}

impl SiteArgs {
    fn build_options(&self) -> Result<BuildOptions, Box<dyn std::error::Error>> {
        let source = std::path::absolute(&self.source)?;
        let dest = std::path::absolute(&self.dest)?;
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| source.join(CONFIG_FILE_NAME));
        let project = ProjectConfig::load(&config_path)?;

        let mode = if self.production {
            BuildMode::Production
        } else {
            BuildMode::Debug
        };
        let mut options = BuildOptions::new(source, dest)
            .with_mode(mode)
            .with_full(self.full)
            .with_project(project);
        if let Some(compile_dir) = &self.compile_dir {
            options = options.with_compile_dir(std::path::absolute(compile_dir)?);
        }
        Ok(options)
    }
}

fn init_logging(quiet: bool) {
    let default_level = if quiet { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}

fn summarize(report: &BuildReport) {
    for failure in report.failures.iter() {
        eprintln!("error: {failure}");
    }
    if let Some(e) = &report.aggregation_error {
        eprintln!("error: {e}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => {
            init_logging(args.quiet);
            let options = args.build_options()?;
            let mut pipeline = RebuildPipeline::with_defaults(options);
            let report = pipeline.cold_build()?;
            summarize(&report);
            if !report.is_clean() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Watch(args) => {
            init_logging(args.quiet);
            let options = args.build_options()?;
            let filter = ChangeFilter::for_options(&options)?;
            let scheduler = WatchScheduler::new(options.project.watch.quiet_period());

            let mut pipeline = RebuildPipeline::with_defaults(options);
            let report = pipeline.cold_build()?;
            summarize(&report);

            let service = WatchService::start(filter, scheduler, pipeline)?;
            println!("Watching for changes. Press Ctrl-C to stop.");

            let (stop_tx, stop_rx) = channel::<()>();
            ctrlc::set_handler(move || {
                println!("\nShutting down...");
                let _ = stop_tx.send(());
            })?;
            let _ = stop_rx.recv();

            service.stop()?;
            println!("Shutdown complete");
            Ok(())
        }
    }
}
