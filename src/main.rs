use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::ratelimit::{LimiterBuilder, RuleConfig};
use sluice::store::{self, PgEventRepository, PgLockCoordinator};
use sluice::{Clock, Limiter, SluiceError, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Sliding-window rate limiting over a shared event log")]
struct Cli {
    /// Configuration file (YAML); `SLUICE__*` environment variables override it
    #[arg(short, long, env = "SLUICE_CONFIG")]
    config: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the events table and index
    Migrate,
    /// Wait until every rule allows it, then record an event
    Track(LimitArgs),
    /// Report whether any rule is at quota (exit code 1 if so, 2 on bad rules)
    Limited(LimitArgs),
    /// Record an event without checking rules
    Increment { event_type: String },
    /// Print recorded events as JSON lines
    Events { event_type: String },
    /// Delete events older than the retention horizon
    Sweep,
}

#[derive(Args, Debug)]
struct LimitArgs {
    event_type: String,

    /// Rule as MAX/WINDOW, e.g. `5/day` or `100/15m`; replaces configured rules
    #[arg(long = "rule", value_name = "MAX/WINDOW")]
    rules: Vec<RuleConfig>,
}

type PgLimiter = Limiter<PgEventRepository, PgLockCoordinator>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            exit_code_for(&e)
        }
    }
}

/// Exit code 2 for rejected configuration, 1 for every other failure.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let configuration = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<SluiceError>())
        .any(SluiceError::is_configuration);
    if configuration {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = SluiceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let pool = store::connect(&config.database).await?;
    let repository = Arc::new(PgEventRepository::new(pool.clone()));
    let lock = Arc::new(PgLockCoordinator::new(pool));

    let builder = || {
        PgLimiter::builder(repository.clone(), lock.clone()).settings(config.limiter.clone())
    };

    match cli.command {
        Command::Migrate => {
            repository.migrate().await?;
        }
        Command::Track(args) => {
            let limiter = configure(builder(), &config, &args)?;
            tokio::select! {
                event = limiter.track() => {
                    let event = event?;
                    info!(event_type = %event.event_type, id = event.id, "Tracked event");
                    println!("{}", serde_json::to_string(&event)?);
                }
                _ = shutdown_signal() => {
                    info!("Interrupted while waiting for quota");
                    return Ok(ExitCode::from(130));
                }
            }
        }
        Command::Limited(args) => {
            let limiter = configure(builder(), &config, &args)?;
            match limiter.evaluate().await? {
                Some(on_limit) => {
                    println!("limited (on_limit: {})", on_limit.name());
                    return Ok(ExitCode::from(1));
                }
                None => println!("not limited"),
            }
        }
        Command::Increment { event_type } => {
            let limiter = builder().event_type(event_type).build();
            let event = limiter.increment().await?;
            println!("{}", serde_json::to_string(&event)?);
        }
        Command::Events { event_type } => {
            let limiter = builder().event_type(event_type).build();
            for event in limiter.events().await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::Sweep => {
            let limiter = builder().build();
            let removed = limiter.sweep().await?;
            println!("removed {} events", removed);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Apply rules from the command line, or the configured definition for the
/// event type when none were given.
fn configure(
    mut builder: LimiterBuilder<PgEventRepository, PgLockCoordinator>,
    config: &SluiceConfig,
    args: &LimitArgs,
) -> anyhow::Result<PgLimiter> {
    if args.rules.is_empty() {
        match config.limiter(&args.event_type) {
            Some(definition) => {
                builder.define(definition)?;
            }
            None => {
                info!(event_type = %args.event_type, "No rules configured; events are never limited");
                builder = builder.event_type(args.event_type.clone());
            }
        }
    } else {
        builder = builder.event_type(args.event_type.clone());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        for rule in &args.rules {
            builder.limit(rule.to_spec(clock.clone())?)?;
        }
    }
    Ok(builder.build())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_for_configuration_errors() {
        let err = anyhow::Error::new(SluiceError::InvalidMaxEvents(Some(0)));
        assert_eq!(exit_code_for(&err), ExitCode::from(2));

        let wrapped =
            anyhow::Error::new(SluiceError::Config("bad".into())).context("loading configuration");
        assert_eq!(exit_code_for(&wrapped), ExitCode::from(2));

        let err = anyhow::Error::new(SluiceError::Lock("down".into()));
        assert_eq!(exit_code_for(&err), ExitCode::FAILURE);
    }
}
