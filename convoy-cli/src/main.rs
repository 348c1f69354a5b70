//! Convoy CLI
//!
//! Starts the orchestrator for a project and mirrors its event stream to the
//! terminal. The dashboard and HTTP control surface are separate
//! collaborators; this binary is the headless entry point.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use convoy_core::{Event, FeatureStatus, FeatureStore, Orchestrator, ProjectConfig};
use convoy_db::{Database, SessionLog};

/// Convoy: parallel feature pipelines for coding agents
#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Run the orchestrator for a project
    Start {
        /// Project root (must contain convoy.json)
        #[arg(default_value = ".")]
        project_root: PathBuf,
    },

    /// List features and their statuses
    Features {
        #[arg(default_value = ".")]
        project_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.verbose {
        tracing::info!("Verbose mode enabled");
    }

    let result = match cli.command {
        Some(Commands::Start { project_root }) => start(project_root).await,
        Some(Commands::Features { project_root }) => list_features(project_root),
        None => {
            println!("Convoy - parallel feature pipelines for coding agents");
            println!();
            println!("Use --help for usage information");
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn start(project_root: PathBuf) -> anyhow::Result<()> {
    let project_root = project_root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("cannot resolve {}: {}", project_root.display(), e))?;

    let config = ProjectConfig::load(&project_root)?;

    if !config.tracks_configured || config.tracks.is_empty() {
        anyhow::bail!(
            "no tracks configured in convoy.json; run the init wizard or add a `tracks` \
             section with exactly one default track"
        );
    }

    let db = Database::connect(project_root.join(".convoy").join("sessions.db")).await?;
    let sessions = SessionLog::new(db.pool().clone());
    let orchestrator = Orchestrator::new(&project_root, config, sessions)?;

    let mut events = orchestrator.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::FeatureUpdated { feature } => {
                    tracing::info!(
                        feature = feature.id,
                        status = ?feature.status,
                        reason = feature.failure_reason.as_deref().unwrap_or(""),
                        "feature updated"
                    );
                }
                Event::SessionStarted { session_id, feature_id, track } => {
                    tracing::info!(session = %session_id, feature = feature_id, track = %track, "session started");
                }
                Event::SessionFinished { session_id, success, .. } => {
                    tracing::info!(session = %session_id, success, "session finished");
                }
                Event::TrackCriticalFailure { track, reason } => {
                    tracing::error!(track = %track, "track paused: {}", reason);
                }
                Event::NewCategories { categories } => {
                    tracing::info!(?categories, "categories without a dedicated track");
                }
                Event::OrchestratorStatus { .. } => {}
            }
        }
    });

    tracing::info!(root = %project_root.display(), "starting orchestrator");
    orchestrator.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; stopping after in-flight features");
            orchestrator.stop();
        }
        _ = orchestrator.join() => {}
    }
    orchestrator.join().await;
    printer.abort();

    tracing::info!("orchestrator stopped");
    Ok(())
}

fn list_features(project_root: PathBuf) -> anyhow::Result<()> {
    let config = ProjectConfig::load(&project_root)?;
    let store = FeatureStore::new(project_root.join(&config.features_path));
    let features = store.load_features()?;

    if features.is_empty() {
        println!("No features in {}", config.features_path);
        return Ok(());
    }

    for feature in features {
        let marker = match feature.status {
            FeatureStatus::Passed => "+",
            FeatureStatus::Failed => "x",
            FeatureStatus::Verifying => "~",
            FeatureStatus::Open => " ",
        };
        let mut line = format!("[{}] #{:<4} {:<12} {}", marker, feature.id, feature.category, feature.name);
        if let Some(reason) = &feature.failure_reason {
            line.push_str(&format!(" ({})", reason));
        }
        println!("{}", line);
    }
    Ok(())
}
