//! mapsync command-line tool.
//!
//! Uploads local edits to a versioned entity graph: reloads the remote
//! copies of everything touched, merges what merges cleanly, walks the user
//! through the remaining conflicts, and writes the committed changeset.
//! Snapshots, edits, and the remote state are JSON files.

mod conflicts;
mod files;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use mapsync_core::config::AppConfig;
use mapsync_core::difference::discard_tags;
use mapsync_core::save_engine::ProgressReporter;
use mapsync_core::{History, SaveOrchestrator, SaveOutcome, SaveRequest};

use conflicts::ResolveMode;

/// Retries allowed after conflict resolution before giving up.
const MAX_RETRIES: usize = 5;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// mapsync command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "mapsync",
    version,
    about = "Upload local map edits as one changeset, with conflict review"
)]
struct Cli {
    /// Path to the TOML configuration file
    /// (default: <config dir>/mapsync/config.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override: trace, debug, info, warn, error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile local edits against the remote and commit them.
    Save {
        /// Base snapshot the edits were made against.
        #[arg(long)]
        base: PathBuf,

        /// Local edits file.
        #[arg(long)]
        edits: PathBuf,

        /// Current remote snapshot.
        #[arg(long)]
        remote: PathBuf,

        /// Changeset comment.
        #[arg(short = 'm', long)]
        comment: String,

        /// Imagery used while editing (repeatable).
        #[arg(long = "imagery")]
        imagery_used: Vec<String>,

        /// Resolve every conflict without prompting.
        #[arg(long, value_enum)]
        resolve: Option<ResolveMode>,

        /// Write the pending change set here if conflicts are found.
        #[arg(long)]
        export_pending: Option<PathBuf>,

        /// Where to write the committed changeset.
        #[arg(short, long, default_value = "./changeset.json")]
        output: PathBuf,
    },

    /// Show the changes the local edits would upload.
    Diff {
        /// Base snapshot the edits were made against.
        #[arg(long)]
        base: PathBuf,

        /// Local edits file.
        #[arg(long)]
        edits: PathBuf,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./mapsync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .init();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command {
        Commands::Save {
            base,
            edits,
            remote,
            comment,
            imagery_used,
            resolve,
            export_pending,
            output,
        } => {
            let request = SaveRequest {
                comment,
                imagery_used,
            };
            let paths = SavePaths {
                base,
                edits,
                remote,
                export_pending,
                output,
            };
            cmd_save(&config, &paths, &request, resolve).await
        }
        Commands::Diff { base, edits } => cmd_diff(&config, &base, &edits),
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(cli.config.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mapsync").join("config.toml"))
}

/// Load the config from `path`, or from the default location when present,
/// or fall back to built-in defaults.
fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        return AppConfig::load_and_validate(path).context("failed to load configuration file");
    }
    match default_config_path() {
        Some(path) if path.exists() => {
            AppConfig::load_and_validate(&path).context("failed to load configuration file")
        }
        _ => Ok(AppConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Terminal spinner shown while a save attempt is in flight.
#[derive(Default)]
struct Spinner {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressReporter for Spinner {
    fn begin(&self, message: &str) {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
            spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        spinner.set_message(format!("{message}..."));
        spinner.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut bar) = self.bar.lock() {
            *bar = Some(spinner);
        }
    }

    fn end(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(spinner) = bar.take() {
                spinner.finish_and_clear();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

struct SavePaths {
    base: PathBuf,
    edits: PathBuf,
    remote: PathBuf,
    export_pending: Option<PathBuf>,
    output: PathBuf,
}

async fn cmd_save(
    config: &AppConfig,
    paths: &SavePaths,
    request: &SaveRequest,
    resolve: Option<ResolveMode>,
) -> Result<()> {
    let history = files::load_history(&paths.base, &paths.edits)?;
    let loader = Arc::new(files::FileLoader::open(&paths.remote)?);
    let committer = Arc::new(files::FileCommitter::new(paths.output.clone()));

    let mut save = SaveOrchestrator::new(history, loader, committer, config)
        .with_progress(Arc::new(Spinner::default()));

    let mut outcome = save
        .attempt_save(request, false)
        .await
        .context("save attempt failed")?;
    let mut retries = 0;

    loop {
        match outcome {
            SaveOutcome::Success {
                changeset_id,
                comment,
            } => {
                println!(
                    "{}",
                    style::success(&format!("Changeset {} committed: {}", changeset_id, comment))
                );
                println!("  Written to: {}", paths.output.display());
                let stats = save.stats();
                println!(
                    "  {}",
                    style::dim(&format!(
                        "checked {}, merged {}, attempts {}",
                        stats.entities_checked, stats.merged, stats.attempts
                    ))
                );
                return Ok(());
            }
            SaveOutcome::NoChanges => {
                println!("{}", style::warn("No changes to upload"));
                return Ok(());
            }
            SaveOutcome::Errors(errors) => {
                conflicts::print_errors(&errors);
                bail!("save failed with {} error(s)", errors.len());
            }
            SaveOutcome::Conflicts(found) => {
                if let (Some(path), Some(pending)) = (&paths.export_pending, save.pending_changes()) {
                    files::write_json(path, pending)?;
                    println!(
                        "{}",
                        style::dim(&format!("Pending changes exported to {}", path.display()))
                    );
                }

                conflicts::print_conflicts(&found);
                if retries >= MAX_RETRIES {
                    save.cancel().context("failed to cancel save")?;
                    bail!("conflicts remain after {} retries", MAX_RETRIES);
                }

                let Some(picks) = conflicts::choose(&found, resolve)? else {
                    save.cancel().context("failed to cancel save")?;
                    println!("{}", style::warn("Save cancelled; edits left unchanged"));
                    return Ok(());
                };
                for (id, index) in picks {
                    debug!(%id, index, "applying conflict choice");
                    save.resolve_conflict(&id, index)
                        .with_context(|| format!("failed to resolve conflict {}", id))?;
                }

                retries += 1;
                outcome = save
                    .attempt_save(request, true)
                    .await
                    .context("save retry failed")?;
            }
        }
    }
}

fn cmd_diff(config: &AppConfig, base: &Path, edits: &Path) -> Result<()> {
    let history = files::load_history(base, edits)?;
    let diff = discard_tags(&history.difference(), |key| config.save.is_discardable(key));

    if diff.is_empty() {
        println!("{}", style::success("No changes"));
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("Changes ({})", diff.len())));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Change", "ID", "Name", "Version"]);

    for change in diff.changes() {
        let entity = change.head.as_ref().or(change.base.as_ref());
        let name = entity.map(|e| e.display_name()).unwrap_or_default();
        let version = entity
            .and_then(|e| e.version)
            .map(|v| format!("v{}", v))
            .unwrap_or_else(|| "new".to_string());
        table.add_row(vec![
            Cell::new(style::change_kind(&change.kind.to_string())),
            Cell::new(change.id.as_str()),
            Cell::new(name),
            Cell::new(version),
        ]);
    }

    println!("{}", table);
    println!();
    Ok(())
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# mapsync configuration

[logging]
level = "warn"

[save]
reload_chunk_size = 150
default_choice = "keep_remote"
discardable_tags = ["created_by", "odbl", "odbl:note", "tiger:upload_uuid",
                    "tiger:tlid", "tiger:source", "tiger:separated",
                    "geobase:datasetName", "geobase:uuid", "sub_sea:type"]

[remote]
# user_url_template = "https://www.openstreetmap.org/user/{user}"
"#;

    if output.exists() {
        bail!(
            "{} already exists; refusing to overwrite",
            output.display()
        );
    }
    std::fs::write(output, default_config)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "{}",
        style::success(&format!("Configuration written to {}", output.display()))
    );
    Ok(())
}

fn cmd_validate(path: Option<&Path>) -> Result<()> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => path,
        None => bail!("no configuration file given and no config directory found"),
    };
    AppConfig::load_and_validate(&path)
        .with_context(|| format!("{} is invalid", path.display()))?;
    println!(
        "{}",
        style::success(&format!("{} is valid", path.display()))
    );
    Ok(())
}
