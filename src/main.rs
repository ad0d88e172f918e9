//! Pakforge - cosmetic mod deployment pipeline
//!
//! Thin CLI shell over the generation pipeline; the heavy lifting lives in
//! the library crate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use pakforge::extract::find_vpk_tool;
use pakforge::pipeline::{GenerationOutcome, ModRequest, Pipeline, PipelineConfig, UserDecision};
use pakforge::priority::ModPriorityConfig;
use pakforge::runner::{no_cancel, TokioCommandRunner};

#[derive(Parser)]
#[command(name = "pakforge")]
#[command(version)]
#[command(about = "Cosmetic mod deployment for Source-engine installations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and install the archive for a mod set
    Generate {
        /// JSON manifest describing the requested mods
        manifest: PathBuf,

        /// Live game installation directory
        #[arg(short, long)]
        install: PathBuf,

        /// Mirror base URL (repeat for multiple mirrors)
        #[arg(short, long = "mirror", required = true)]
        mirrors: Vec<String>,

        /// Optional JSON file with decisions for previously blocked conflicts
        #[arg(short, long)]
        decisions: Option<PathBuf>,

        /// Override the private data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Remove a previously installed entry from the install log
    Remove {
        mod_id: String,

        #[arg(short, long)]
        install: PathBuf,

        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Delete all cached downloads
    ClearCache,

    /// Show or edit the persisted mod priority table
    Priority {
        #[arg(short, long)]
        install: PathBuf,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Set `MOD_ID=PRIORITY` instead of listing
        #[arg(short, long)]
        set: Option<String>,
    },
}

fn cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("pakforge")
}

fn data_dir(install: &PathBuf, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| install.join("pakforge"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Generate {
            manifest,
            install,
            mirrors,
            decisions,
            data_dir: data_override,
        } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Cannot read manifest {}", manifest.display()))?;
            let requests: Vec<ModRequest> =
                serde_json::from_str(&text).context("Malformed mod manifest")?;

            let decisions: Vec<UserDecision> = match decisions {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("Cannot read decisions {}", path.display()))?;
                    serde_json::from_str(&text).context("Malformed decisions file")?
                }
                None => Vec::new(),
            };

            let config = PipelineConfig {
                mirrors,
                cache_root: cache_root(),
                data_dir: data_dir(&install, data_override),
                work_dir: cache_root().join("work"),
                install_dir: install,
                vpk_tool: find_vpk_tool()?,
            };

            let progress = ProgressBar::new(0);
            progress.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )
                .context("Invalid progress bar template")?
                .progress_chars("=>-"),
            );

            let pipeline =
                Pipeline::new(TokioCommandRunner, config).with_progress_bar(progress);
            match pipeline.generate(requests, &decisions, no_cancel()).await? {
                GenerationOutcome::Installed { archive, resolutions } => {
                    println!("Installed {}", archive.display());
                    for r in resolutions {
                        if let Some(winner) = r.winning_source {
                            println!(
                                "  conflict {} -> {} ({:?})",
                                r.conflict_id, winner.mod_id, r.used_strategy
                            );
                        } else {
                            println!("  conflict {} -> merged", r.conflict_id);
                        }
                    }
                }
                GenerationOutcome::BlockedOnConflicts(blocked) => {
                    println!("{} conflict(s) need a decision:", blocked.len());
                    for c in blocked {
                        let mods: Vec<&str> = c
                            .conflicting_sources
                            .iter()
                            .map(|s| s.mod_id.as_str())
                            .collect();
                        println!(
                            "  {:?} conflict between {} ({:?} severity)",
                            c.conflict_type,
                            mods.join(", "),
                            c.severity
                        );
                    }
                    println!("Provide a decisions file with --decisions and rerun.");
                }
            }
        }

        Commands::Remove {
            mod_id,
            install,
            data_dir: data_override,
        } => {
            let config = PipelineConfig {
                mirrors: Vec::new(),
                cache_root: cache_root(),
                data_dir: data_dir(&install, data_override),
                work_dir: cache_root().join("work"),
                install_dir: install,
                vpk_tool: PathBuf::from("vpk"),
            };
            let pipeline = Pipeline::new(TokioCommandRunner, config);
            match pipeline.remove_installed_entry(&mod_id)? {
                Some(files) => {
                    println!("Removed {} ({} owned files):", mod_id, files.len());
                    for f in files {
                        println!("  {f}");
                    }
                    println!("Regenerate to rebuild the archive without them.");
                }
                None => println!("No installed entry named {mod_id}"),
            }
        }

        Commands::ClearCache => {
            pakforge::fetch::clear_cache(&cache_root())?;
            println!("Cache cleared.");
        }

        Commands::Priority {
            install,
            data_dir: data_override,
            set,
        } => {
            let path = ModPriorityConfig::path_in(&data_dir(&install, data_override));
            let mut config = ModPriorityConfig::load(&path)?;

            match set {
                Some(assignment) => {
                    let (mod_id, value) = assignment
                        .split_once('=')
                        .context("Expected MOD_ID=PRIORITY")?;
                    let priority: u32 = value.parse().context("Priority must be a number")?;
                    config.set_priority(mod_id, priority);
                    config.save(&path)?;
                    println!("{} -> {}", mod_id, config.priority_for(mod_id).unwrap());
                }
                None => {
                    if config.priorities.is_empty() {
                        println!("No priorities set.");
                    }
                    for (mod_id, priority) in &config.priorities {
                        println!("{priority:>4}  {mod_id}");
                    }
                }
            }
        }
    }

    Ok(())
}
