use clap::{Parser, Subcommand};
use gitlab_poller_lib::config::{self, CliOverrides, PollMode, PollerConfig, StoreKind};
use gitlab_poller_lib::{app, db, CycleOutcome, PollError, Poller};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "gitlab-poller")]
#[command(version, about = "Poll GitLab and keep a local record of merge requests and events")]
struct Cli {
    /// KEY=value file used instead of ~/.gitlab-poller/config
    #[arg(long, global = true, env = "GITLAB_POLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Polling interval in minutes
    #[arg(long, global = true)]
    interval: Option<u64>,

    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Where records are written
    #[arg(long, global = true, value_enum)]
    store: Option<StoreKind>,

    /// Do not show desktop notifications
    #[arg(long, global = true)]
    no_notify: bool,

    /// Run a single cycle and exit
    #[arg(long, global = true)]
    once: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll open merge requests assigned to a reviewer
    MergeRequests {
        /// Reviewer user id or username (overrides GITLAB_REVIEWER_ID)
        #[arg(long)]
        reviewer: Option<String>,

        /// Group id or path (overrides GITLAB_GROUP_ID)
        #[arg(long)]
        group: Option<String>,

        /// Project id or path (overrides GITLAB_PROJECT_ID)
        #[arg(long)]
        project: Option<String>,
    },

    /// Poll the activity event stream
    Events {
        /// Project id or path, or "all" (overrides GITLAB_PROJECT_ID)
        #[arg(long)]
        project: Option<String>,
    },
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init also routes `log` records from the library into tracing
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

fn resolve_config(cli: &Cli) -> Result<PollerConfig, PollError> {
    let (mode, overrides) = match &cli.command {
        Command::MergeRequests {
            reviewer,
            group,
            project,
        } => (
            PollMode::MergeRequests,
            CliOverrides {
                reviewer: reviewer.clone(),
                group: group.clone(),
                project: project.clone(),
                ..Default::default()
            },
        ),
        Command::Events { project } => (
            PollMode::Events,
            CliOverrides {
                project: project.clone(),
                ..Default::default()
            },
        ),
    };
    let overrides = CliOverrides {
        interval_minutes: cli.interval,
        db_path: cli.db.clone(),
        store: cli.store,
        no_notify: cli.no_notify,
        ..overrides
    };

    let data_dir = db::data_dir();
    let working_dir = std::env::current_dir().ok();
    let values = config::load_values(
        data_dir.as_deref(),
        working_dir.as_deref(),
        cli.config.as_deref(),
        std::env::vars(),
    )?;
    PollerConfig::resolve(mode, &values, &overrides, db::default_db_path())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run(cli: Cli) -> Result<(), PollError> {
    let config = resolve_config(&cli)?;
    let reconciler = app::initialize(&config).await?;

    if cli.once {
        let outcome = reconciler.run_cycle().await;
        reconciler.shutdown().await;
        return match outcome {
            CycleOutcome::FetchFailed(e) => Err(e),
            _ => Ok(()),
        };
    }

    let handle = Poller::new(reconciler, config.interval).start();
    log::info!("Press Ctrl+C to stop");

    shutdown_signal().await;
    log::info!("Shutting down...");
    handle.stop().await;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
