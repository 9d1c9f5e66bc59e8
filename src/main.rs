use anyhow::{Context, Result, bail};
use backsweep::config::{AppConfig, DEFAULT_CONFIG_FILE};
use backsweep::core::backend::{self, BackendKind};
use backsweep::core::{BackupJob, Orchestrator, RestoreJob, RunHandle, RunState, RunSummary};
use backsweep::db::{Catalog, CatalogError, records, runs, settings};
use backsweep::{core::verifier, logging};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "backsweep")]
#[command(about = "Incremental backup and restore to mirror and object store backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up the source tree to every enabled backend
    Backup,
    /// Restore cataloged files from one backend
    Restore(RestoreArgs),
    /// Print catalog settings and counts as JSON
    Status,
    /// Re-hash every cataloged file on the mirror destination
    Verify,
    /// Check that every enabled backend is reachable and writable
    TestBackends,
    /// Write the effective configuration to a TOML file
    InitConfig { path: PathBuf },
}

#[derive(Args)]
struct RestoreArgs {
    /// Folder to restore into
    #[arg(long)]
    destination: PathBuf,

    /// Backend to restore from; defaults to the mirror when enabled
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Replace files that already exist in the destination
    #[arg(long)]
    overwrite: bool,

    /// With --overwrite, only replace files older than the cataloged version
    #[arg(long, requires = "overwrite")]
    only_if_older: bool,

    /// Delete destination files and folders that are not in the catalog
    #[arg(long)]
    purge: bool,

    /// Replace the local catalog with the snapshot stored on the backend
    #[arg(long)]
    catalog_from_backend: bool,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    source_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    catalog_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_depth: Option<usize>,

    #[serde(skip_serializing_if = "LogOverrides::is_empty")]
    #[command(flatten)]
    log: LogOverrides,
}

#[derive(Args, Serialize)]
struct LogOverrides {
    /// Log as JSON
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl LogOverrides {
    fn is_empty(&self) -> bool {
        !self.json && !self.verbose
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config, Some(&cli.overrides))?;
    logging::init((&config.log).into());

    match cli.command {
        Commands::Backup => run_backup(&config).context("Backup failed"),
        Commands::Restore(args) => run_restore(&config, args).context("Restore failed"),
        Commands::Status => run_status(&config).context("Failed to read catalog status"),
        Commands::Verify => run_verify(&config).context("Verification failed"),
        Commands::TestBackends => run_test_backends(&config).context("Backend test failed"),
        Commands::InitConfig { path } => {
            std::fs::write(&path, config.to_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote configuration to {}", path.display());
            Ok(())
        }
    }
}

fn run_backup(config: &AppConfig) -> Result<()> {
    let rules = config
        .ignore
        .compile()
        .context("Invalid ignore patterns")?;
    let backends = backend::create_backends(config).context("Invalid backend configuration")?;
    if backends.is_empty() {
        warn!("No backends enabled, only the catalog will be updated");
    }

    let job = BackupJob::new(&config.source_root, &config.catalog_path, backends)
        .rules(rules)
        .max_depth(config.max_depth)
        .hash_chunk_size(config.hash_chunk_size);

    let handle = Orchestrator::new().start_backup(job)?;
    report(await_run(handle))
}

fn run_restore(config: &AppConfig, args: RestoreArgs) -> Result<()> {
    let kind = match args.backend {
        Some(kind) => kind,
        None if config.mirror.enabled => BackendKind::Mirror,
        None if config.object_store.enabled => BackendKind::ObjectStore,
        None => bail!("No backend enabled to restore from"),
    };
    let source = backend::create_backend(kind, config)
        .with_context(|| format!("Invalid {} configuration", kind.as_str()))?;

    let job = RestoreJob::new(&config.catalog_path, source, args.destination)
        .overwrite(args.overwrite, args.only_if_older)
        .purge(args.purge)
        .catalog_from_backend(args.catalog_from_backend);

    let handle = Orchestrator::new().start_restore(job)?;
    report(await_run(handle))
}

/// Consume events until the worker exits, cancelling on Ctrl-C.
fn await_run(mut handle: RunHandle) -> RunSummary {
    cancel_on_interrupt(handle.cancel_token());
    while handle.next_event().is_some() {}
    handle.wait().1
}

fn cancel_on_interrupt(token: CancellationToken) {
    let spawned = thread::Builder::new()
        .name("backsweep-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Ctrl-C handling unavailable");
                    return;
                }
            };

            runtime.block_on(async {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => match result {
                        Ok(()) => {
                            info!("Interrupt received, stopping after the current item");
                            token.cancel();
                        }
                        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
                    },
                    _ = token.cancelled() => {}
                }
            });
        });

    if let Err(e) = spawned {
        warn!(error = %e, "Ctrl-C handling unavailable");
    }
}

fn report(summary: RunSummary) -> Result<()> {
    let stats = &summary.stats;
    println!(
        "{} {}: {} copied, {} skipped, {} purged, {} warning(s)",
        summary.kind.as_str(),
        summary.state.as_str(),
        stats.files_copied,
        stats.files_skipped,
        stats.files_purged + stats.folders_purged,
        stats.warnings
    );

    match (summary.state, summary.failure) {
        (RunState::Error, Some(failure)) => Err(failure.into()),
        (RunState::Error, None) => bail!("run ended in error"),
        _ => Ok(()),
    }
}

fn run_status(config: &AppConfig) -> Result<()> {
    let catalog = match Catalog::open(&config.catalog_path) {
        Ok(catalog) => catalog,
        Err(CatalogError::InUse { lock_path }) => {
            let status = json!({
                "catalog": config.catalog_path.display().to_string(),
                "in_use": true,
                "lock_path": lock_path.display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let status = json!({
        "catalog": catalog.path().display().to_string(),
        "in_use": false,
        "files": records::count(&catalog)?,
        "folders": records::list_folders(&catalog)?.len(),
        "settings": settings::all(&catalog)?,
        "recent_runs": runs::recent(&catalog, 5)?,
    });
    catalog.close()?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn run_verify(config: &AppConfig) -> Result<()> {
    if !config.mirror.enabled {
        bail!("The mirror backend is not enabled");
    }

    let catalog = Catalog::open(&config.catalog_path)?;
    let records = records::list(&catalog)?;
    catalog.close()?;

    let result = verifier::verify_mirror(&config.mirror.destination, &records)?;
    println!(
        "Verified {} file(s), {} bytes",
        result.files_verified, result.bytes_verified
    );
    Ok(())
}

fn run_test_backends(config: &AppConfig) -> Result<()> {
    let backends = backend::create_backends(config).context("Invalid backend configuration")?;
    if backends.is_empty() {
        bail!("No backends enabled");
    }

    let mut failed = 0;
    for backend in &backends {
        match backend.setup_initial() {
            Ok(()) => println!("ok      {} ({})", backend.name(), backend.destination()),
            Err(e) => {
                failed += 1;
                println!("failed  {}: {}", backend.name(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} backend(s) failed", failed, backends.len());
    }
    Ok(())
}
