use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use overlay_patcher::{PatchError, PatchFailure, Patcher, PatcherConfig};
use similar::{ChangeTag, TextDiff};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "overlay-patcher")]
#[command(about = "Method-level patching of PHP source trees", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the base (original files) path
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    /// Override the patch files path
    #[arg(long, global = true)]
    patch: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan both trees and build or refresh every merged file
    Build {
        /// Show a diff of drifted methods when a conflict is found
        #[arg(short, long)]
        diff: bool,
    },

    /// Show which files are patched and how
    Status,

    /// Print the path that should be served for a file
    Resolve {
        /// File under the base path (absolute, or relative to it)
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Build { diff } => cmd_build(config, diff),
        Commands::Status => cmd_status(config),
        Commands::Resolve { file } => cmd_resolve(config, &file),
    }
}

fn load_config(cli: &Cli) -> Result<PatcherConfig> {
    let mut config = match &cli.config {
        Some(path) => PatcherConfig::load_from_path(path)?,
        None => PatcherConfig::default(),
    };
    if let Some(base) = &cli.base {
        config.base_path = base.clone();
    }
    if let Some(patch) = &cli.patch {
        config.patch_path = patch.clone();
    }
    if let Some(cache) = &cli.cache {
        config.cache_path = cache.clone();
    }
    Ok(config)
}

fn cmd_build(config: PatcherConfig, diff: bool) -> Result<()> {
    let mut patcher = Patcher::new(config)?;
    let failures = patcher.refresh()?;

    for entry in patcher.entries() {
        let category = if entry.full_replace {
            "replaced".cyan()
        } else {
            "patched".green()
        };
        println!("{} {}", category, entry.relative);
        if !entry.record.replaced_functions.is_empty() {
            let names: Vec<&str> = entry
                .record
                .replaced_functions
                .keys()
                .map(String::as_str)
                .collect();
            println!("  {}", format!("overrides: {}", names.join(", ")).dimmed());
        }
    }

    for failure in &failures {
        report_failure(failure, diff);
    }

    let patched = patcher.entries().count();
    if failures.is_empty() {
        println!("{}", format!("{patched} file(s) ready").bold());
        Ok(())
    } else {
        anyhow::bail!("{} file(s) could not be patched", failures.len())
    }
}

fn cmd_status(config: PatcherConfig) -> Result<()> {
    let mut patcher = Patcher::new(config)?;
    let failures = patcher.refresh()?;

    if patcher.entries().count() == 0 && failures.is_empty() {
        println!("no files to patch");
        return Ok(());
    }

    for entry in patcher.entries() {
        let category = if entry.full_replace {
            "full replacement"
        } else {
            "method merge"
        };
        println!("{} ({})", entry.relative.bold(), category);
        println!("  serves: {}", entry.record.merged_file.display());
        for name in entry.record.replaced_functions.keys() {
            println!("  {}", format!("override {name}").dimmed());
        }
    }
    for failure in &failures {
        println!("{} ({})", failure.relative.bold(), "conflict".red());
        println!("  {}", failure.error);
    }
    Ok(())
}

fn cmd_resolve(config: PatcherConfig, file: &Path) -> Result<()> {
    let mut patcher = Patcher::new(config)?;
    patcher.refresh()?;

    let requested = if file.is_absolute() {
        file.to_path_buf()
    } else {
        patcher.config().base_path.join(file)
    };
    let requested = requested.canonicalize().unwrap_or(requested);

    let resolved = patcher.resolve(&requested)?;
    println!("{}", resolved.display());
    Ok(())
}

fn report_failure(failure: &PatchFailure, diff: bool) {
    eprintln!(
        "{} {}: {}",
        "failed".red().bold(),
        failure.relative,
        failure.error
    );
    if !diff {
        return;
    }
    if let PatchError::UpstreamDrift { methods, .. } = &failure.error {
        for method in methods {
            let Some(recorded) = &method.recorded else {
                eprintln!(
                    "{}",
                    format!("  {} is newly overridden", method.name).yellow()
                );
                continue;
            };
            eprintln!("{}", format!("  --- {} ---", method.name).bold());
            let text_diff = TextDiff::from_lines(recorded.as_str(), method.current.as_str());
            for change in text_diff.iter_all_changes() {
                match change.tag() {
                    ChangeTag::Delete => eprint!("{}", format!("  -{change}").red()),
                    ChangeTag::Insert => eprint!("{}", format!("  +{change}").green()),
                    ChangeTag::Equal => eprint!("   {change}"),
                }
            }
        }
    }
}
