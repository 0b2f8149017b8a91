use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kconfig_refresh::Result;
use kconfig_refresh::executor::{ExecCtx, ExecEvent, ExecSink, StdoutSink};
use kconfig_refresh::fetch::HttpFetcher;
use kconfig_refresh::modules::Pipeline;
use kconfig_refresh::modules::kernel::MakeNormalizer;
use kconfig_refresh::planner::Stage;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a variant definition and print its stages
    Plan {
        /// Path to a variant definition TOML
        build: PathBuf,
    },
    /// Refresh one or more variants, in the order given
    Run {
        /// Paths to variant definition TOMLs
        #[arg(required = true)]
        builds: Vec<PathBuf>,
        /// Print what would run without executing any stage
        #[arg(long)]
        dry_run: bool,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        /// Path to a variant definition TOML
        build: PathBuf,
    },
    /// Resolve the upstream release only and print it as JSON
    Release {
        /// Path to a variant definition TOML
        build: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Plan { build } => cmd_plan(&build),
        Command::Run { builds, dry_run } => {
            for build in &builds {
                cmd_run(build, dry_run)?;
            }
            Ok(())
        }
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Release { build } => cmd_release(&build),
    }
}

fn load_pipeline(path: &Path) -> Result<(Pipeline, kconfig_refresh::planner::Plan)> {
    let doc = kconfig_refresh::config::load(path)?;
    let (variant, plan) = kconfig_refresh::planner::plan(&doc)?;
    let fetcher = HttpFetcher::new(&variant.http)?;
    let normalizer = MakeNormalizer::from_config(&variant.kernel);
    Ok((
        Pipeline::new(variant, Box::new(fetcher), Box::new(normalizer)),
        plan,
    ))
}

fn cmd_plan(path: &Path) -> Result<()> {
    let doc = kconfig_refresh::config::load(path)?;
    let (_, plan) = kconfig_refresh::planner::plan(&doc)?;
    println!("variant: {}", plan.variant());
    for (i, stage) in plan.stages().iter().enumerate() {
        println!("{:>2}. {:<18}  {}", i + 1, stage.id(), stage.label());
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = kconfig_refresh::config::load(path)?;
    // Best-effort pretty print of resolved config.
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &Path, dry_run: bool) -> Result<()> {
    let (mut pipeline, plan) = load_pipeline(path)?;
    println!("VARIANT: {}", plan.variant());
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(dry_run, sink);
    kconfig_refresh::executor::execute_plan(&plan, &mut pipeline, &mut ctx)
}

/// Keeps stdout clean for the JSON descriptor.
struct StderrSink;

impl ExecSink for StderrSink {
    fn emit(&self, ev: ExecEvent) {
        if let ExecEvent::StageLog { id, line } = ev {
            eprintln!("[{id}] {line}");
        }
    }
}

fn cmd_release(path: &Path) -> Result<()> {
    let (mut pipeline, _) = load_pipeline(path)?;
    let mut ctx = ExecCtx::new(false, Arc::new(StderrSink));
    ctx.set_stage(Stage::Resolve.id());
    let descriptor = pipeline.resolve_release(&ctx)?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
