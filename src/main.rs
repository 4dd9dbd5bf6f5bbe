use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, trace, warn, Instrument};

#[macro_use]
extern crate quick_error;

mod config;
mod detection;
mod mqtt;
mod pipeline;
mod ports;

use pipeline::{AdmissionSettings, DurableQueue, Orchestrator, Pipeline, TopicMap, WorkerSettings};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "alert_sink",
    about = "Delivers detector alerts to blob storage, MQTT and a record store."
)]
struct CliArgs {
    #[structopt(
        parse(from_os_str),
        short = "c",
        long = "config",
        default_value = "config.toml",
        help = "Path to configuration file. See sample_config.toml for format.",
        env = "ALERTSINK_CONFIG"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = CliArgs::from_args();
    let cfg = match config::load_config(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(2);
        }
    };

    let filter = tracing_subscriber::EnvFilter::new(&cfg.system.log_level);
    let stdout_subscriber = tracing_subscriber::fmt()
        // Filter from user
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(stdout_subscriber) {
        eprintln!("Unable to install logger: {}", e);
    }

    info!("Alert sink running");
    trace!("Config: {:?}", cfg);

    match run(cfg).await {
        // The blocking stdin read cannot be cancelled, so leave without waiting on the runtime
        Ok(()) => process::exit(0),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}

async fn run(cfg: config::Config) -> Result<(), String> {
    let queue = Arc::new(
        DurableQueue::open(&cfg.queue.path, cfg.queue.capacity).map_err(|e| e.to_string())?,
    );
    let blobs = ports::blob_store_from_config(&cfg.blob_store).await?;
    let records = ports::record_store_from_config(&cfg.record_store)?;
    // Connect to MQTT
    let broker = Arc::new(mqtt::connect(&cfg.mqtt).await?);
    let ports = ports::Ports {
        blobs,
        broker: broker.clone(),
        records,
    };

    let shutdown = CancellationToken::new();
    let pipeline = Pipeline::start(
        queue,
        ports,
        TopicMap::new(cfg.mqtt.topic.clone(), cfg.mqtt.camera_topics.clone()),
        &WorkerSettings::from_config(&cfg.pipeline),
        cfg.pipeline.workers,
        shutdown.clone(),
    )
    .map_err(|e| e.to_string())?;

    // Detections arrive as JSON lines on stdin
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(64);
    let intake = tokio::spawn(
        detection::read_events(
            BufReader::new(tokio::io::stdin()),
            events_tx,
            shutdown.clone(),
        )
        .instrument(info_span!("Intake")),
    );
    let orchestrator = Orchestrator::new(pipeline.queue(), AdmissionSettings::from_config(&cfg));
    let mut admitting = tokio::spawn(orchestrator.run(events_rx, shutdown.clone()));

    let admitted = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            None
        }
        admitted = &mut admitting => {
            info!("Detector input finished");
            Some(admitted)
        }
    };

    shutdown.cancel();
    let admitted = match admitted {
        Some(admitted) => admitted,
        None => admitting.await,
    };
    let outcome = match admitted {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("Admission task failed: {}", e)),
    };
    if let Ok(forwarded) = intake.await {
        info!(forwarded, "Intake stopped");
    }
    pipeline.join().await;
    broker.close().await;
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
