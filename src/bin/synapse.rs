use clap::Parser;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use synapse::{
    config::SystemConfig,
    deferred::UniformDelay,
    envelope::HandlerEntry,
    event_bus::EventBus,
    payload::{payload_from_json, payload_to_json},
    subscription::{handler_fn, SubscriptionScope},
    Error, InternalResult,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// JSON script of events to replay
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct ScriptStep {
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    handlers: Vec<ScriptHandler>,
    /// `[min, max]` in milliseconds; schedules the event instead of emitting it.
    #[serde(default)]
    delay_ms: Option<(u64, u64)>,
}

#[derive(Debug, Deserialize)]
struct ScriptHandler {
    target: String,
    #[serde(default)]
    overrides: serde_json::Value,
}

fn load_config(path: &PathBuf) -> InternalResult<SystemConfig> {
    if path.exists() {
        Ok(SystemConfig::from_file(path)?)
    } else {
        debug!("config file {:?} not found, using defaults", path);
        Ok(SystemConfig::default())
    }
}

fn replay(bus: &EventBus, steps: Vec<ScriptStep>) -> InternalResult<()> {
    for step in steps {
        let payload = payload_from_json(step.payload)?;
        if let Some((min, max)) = step.delay_ms {
            let handle = bus.schedule(
                &step.event,
                payload,
                Duration::from_millis(min),
                Duration::from_millis(max),
                &UniformDelay,
            )?;
            info!("scheduled {} in {:?}", step.event, handle.fire_after());
            continue;
        }

        let handlers = step
            .handlers
            .into_iter()
            .map(|h| HandlerEntry::new(&h.target, payload_from_json(h.overrides)?))
            .collect::<Result<Vec<_>, _>>()?;
        let receipt = bus.emit_with_handlers(&step.event, payload, &handlers)?;
        info!(
            "emitted {} ({} matched, {} fanned out)",
            step.event, receipt.matched, receipt.fanned_out
        );
    }
    Ok(())
}

async fn run(cli: &Cli) -> InternalResult<()> {
    let config = load_config(&cli.config)?;
    info!("config loaded.");
    debug!("config: {:?}", config);

    let bus = EventBus::from_config(&config);

    bus.subscribe(
        "any",
        handler_fn(|envelope| async move {
            println!(
                "[{}] {} {}",
                envelope.source(),
                envelope.name(),
                payload_to_json(envelope.payload())
            );
            Ok(())
        }),
        SubscriptionScope::Global,
        None,
    )?;

    let mut faults = bus.subscribe_faults();
    tokio::spawn(async move {
        while let Ok(fault) = faults.recv().await {
            warn!(
                "handler {} failed on {}: {}",
                fault.subscription_id, fault.event_name, fault.message
            );
        }
    });

    if let Some(script) = &cli.script {
        let content = std::fs::read_to_string(script)
            .map_err(|e| Error::internal(format!("Failed to read script file: {}", e)))?;
        let steps: Vec<ScriptStep> = serde_json::from_str(&content)
            .map_err(|e| Error::internal(format!("Failed to parse script file: {}", e)))?;
        replay(&bus, steps)?;

        while bus.statistics().pending_deferred > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bus.wait_idle().await;
    }

    let statistics = serde_json::to_string_pretty(&bus.statistics())
        .map_err(|e| Error::internal(format!("Failed to encode statistics: {}", e)))?;
    println!("{}", statistics);

    let report = bus.shutdown().await;
    if !report.unfinished.is_empty() {
        warn!("{} handlers did not finish", report.unfinished.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
