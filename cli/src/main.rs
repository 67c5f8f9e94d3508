//! `seestar` - drive a Seestar telescope from the command line

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use seestar_device::{DeviceConfig, SeestarConfig, SeestarSession};
use seestar_scheduler::{DeviceScheduler, SchedulerEvent, StartRequest};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "seestar", version, about = "Seestar remote control")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "SEESTAR_CONFIG")]
    config: Option<PathBuf>,

    /// Device name from the configuration; defaults to the first entry
    #[arg(short, long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a schedule file to the end
    Run {
        schedule: PathBuf,
        /// Keep the schedule and item ids from the file
        #[arg(long)]
        retain_ids: bool,
    },
    /// Print the device's event state
    Status {
        /// Only this event entry
        #[arg(long)]
        event: Option<String>,
        /// Seconds to collect events before printing
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },
    /// Send one raw command and print the response
    Send {
        method: String,
        /// JSON params
        params: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SeestarConfig> {
    match path {
        Some(path) => SeestarConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(SeestarConfig::default()),
    }
}

fn pick_device(config: &SeestarConfig, name: Option<&str>) -> anyhow::Result<DeviceConfig> {
    match name {
        Some(name) => config
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| anyhow!("no device named '{}' in the configuration", name)),
        None => Ok(config.devices.first().cloned().unwrap_or_default()),
    }
}

async fn connect(args: &Args) -> anyhow::Result<Arc<SeestarSession>> {
    let config = load_config(args.config.as_ref())?;
    let device = pick_device(&config, args.device.as_deref())?;
    info!(
        "Connecting to {} at {}:{}",
        device.name, device.ip_address, device.port
    );
    let session = SeestarSession::new(device, &config);
    if !session.start_watch_thread().await {
        bail!("could not connect to {}", session.name());
    }
    Ok(session)
}

async fn run_schedule(
    session: Arc<SeestarSession>,
    schedule: PathBuf,
    retain_ids: bool,
) -> anyhow::Result<()> {
    let scheduler = DeviceScheduler::new(session);
    let imported = scheduler
        .import_schedule(&schedule, retain_ids)
        .with_context(|| format!("importing {}", schedule.display()))?;
    if !imported.is_ok() {
        bail!("import refused: {}", imported.result);
    }

    let mut events = scheduler.subscribe();
    let started = scheduler.start_scheduler(StartRequest {
        schedule_id: None,
        start_item: Some(1),
    });
    if !started.is_ok() {
        bail!("start refused: {}", started.result);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SchedulerEvent::ItemStarted { number, action, .. }) => {
                    info!("Item {}: {}", number, action);
                }
                Ok(SchedulerEvent::ItemFinished { outcome, .. }) => {
                    info!("Item finished: {:?}", outcome);
                }
                Ok(SchedulerEvent::RunFinished(state)) => {
                    info!("Schedule {}", state);
                    break;
                }
                Ok(SchedulerEvent::StateChanged(_)) => {}
                Err(RecvError::Lagged(n)) => warn!("Missed {} scheduler events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping the schedule");
                let result = scheduler.stop_scheduler(None).await;
                info!("{}", result.result);
                break;
            }
        }
    }
    scheduler.session().end_watch_thread().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let session = connect(&args).await?;
    match args.command {
        Command::Run {
            schedule,
            retain_ids,
        } => run_schedule(session, schedule, retain_ids).await?,
        Command::Status { event, wait } => {
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let params = event.map(|name| serde_json::json!({ "event_name": name }));
            let state = session.get_event_state(params.as_ref());
            println!("{}", serde_json::to_string_pretty(&state.result)?);
            session.end_watch_thread().await;
        }
        Command::Send { method, params } => {
            let params: Option<Value> = params
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .context("params must be JSON")?;
            let response = session.send_command_sync(&method, params).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            session.end_watch_thread().await;
        }
    }
    Ok(())
}
