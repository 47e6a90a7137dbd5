//! THP telemetry bridge - command line entry point

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use thp_telemetry::config::TelemetryConfig;
use thp_telemetry::observability::{init_default_logging, init_logging, LogFormat};
use thp_telemetry::publisher::BulkPublisher;
use thp_telemetry::sink::{read_sink_file, MessageSink};
use thp_telemetry::supervisor::{ConnectionSupervisor, SupervisorSettings};
use thp_telemetry::transport::mqtt::{MqttSettings, MqttTransportFactory};
use thp_telemetry::transport::ConnectionState;
use thp_telemetry::OperationResult;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};

/// MQTT telemetry bridge for temperature/humidity/pressure sensors
#[derive(Parser)]
#[command(name = "thp-telemetry")]
#[command(about = "Supervised MQTT listener and paced dataset publisher for THP telemetry")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and record incoming telemetry until Ctrl-C
    Listen {
        /// Sink file, overrides [sink].path
        #[arg(long, value_name = "FILE")]
        sink: Option<PathBuf>,
    },
    /// Replay the dataset to the broker at a fixed pace; Ctrl-C stops the job
    Publish {
        /// Dataset file, overrides [publisher].dataset_path
        #[arg(long, value_name = "FILE")]
        dataset: Option<PathBuf>,
        /// Target topic, overrides the configured publish topic
        #[arg(long)]
        topic: Option<String>,
    },
    /// Publish random readings
    PublishRandom {
        #[arg(long, default_value_t = 1)]
        count: u32,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Print the records stored in a sink file
    Replay {
        /// Sink file, defaults to [sink].path
        path: Option<PathBuf>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    info!("Starting THP telemetry bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { sink } => run_listener(config, sink).await,
        Commands::Publish { dataset, topic } => run_publisher(config, dataset, topic).await,
        Commands::PublishRandom { count, topic } => run_publish_random(config, count, topic).await,
        Commands::Replay { path } => replay_sink(config, path),
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<TelemetryConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(TelemetryConfig::load_from_file(path)?);
    }

    for path_str in ["thp.toml", "config/thp.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(TelemetryConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create thp.toml".into())
}

/// Build a supervisor wired to the MQTT transport
fn build_supervisor(config: &TelemetryConfig, sink: Arc<MessageSink>) -> Arc<ConnectionSupervisor> {
    let factory = MqttTransportFactory::new(MqttSettings::from_broker_section(&config.broker));
    Arc::new(ConnectionSupervisor::new(
        Arc::new(factory),
        SupervisorSettings::from_section(&config.supervisor),
        sink,
    ))
}

fn check(result: OperationResult) -> CliResult {
    if result.is_success() {
        info!(status = ?result.status, "{}", result.detail);
        Ok(())
    } else {
        Err(format!("{:?}: {}", result.error_kind, result.detail).into())
    }
}

/// Connect and wait for the handshake to finish
async fn connect(config: &TelemetryConfig, supervisor: &ConnectionSupervisor) -> CliResult {
    check(supervisor.connect(config.credentials()?).await)?;
    if !supervisor
        .wait_for_state(ConnectionState::Connected, config.handshake_timeout())
        .await
    {
        return Err(format!("Broker not reachable at {}", config.broker.broker_url).into());
    }
    Ok(())
}

async fn run_listener(config: TelemetryConfig, sink_path: Option<PathBuf>) -> CliResult {
    let sink_path = sink_path.unwrap_or_else(|| config.sink.path.clone());
    let sink = Arc::new(MessageSink::with_file(&sink_path));
    let supervisor = build_supervisor(&config, Arc::clone(&sink));

    // A broker that is down at startup is retried by the health check
    if let Err(e) = connect(&config, &supervisor).await {
        warn!("Initial connection failed: {}", e);
    }

    info!(
        sink = %sink_path.display(),
        topic = %supervisor.settings().subscribe_topic,
        "Listening for telemetry, Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            _ = sleep(Duration::from_secs(1)) => {
                for record in sink.take_undelivered() {
                    println!("{record}");
                }
            }
        }
    }

    check(supervisor.disconnect().await)?;
    info!(stats = ?supervisor.ingest_stats(), "Listener stopped");
    Ok(())
}

async fn run_publisher(
    config: TelemetryConfig,
    dataset: Option<PathBuf>,
    topic: Option<String>,
) -> CliResult {
    let supervisor = build_supervisor(&config, Arc::new(MessageSink::in_memory()));
    connect(&config, &supervisor).await?;

    let publisher = BulkPublisher::new(Arc::clone(&supervisor), config.publish_interval());
    let dataset = dataset.unwrap_or_else(|| config.publisher.dataset_path.clone());
    let topic = topic.unwrap_or_else(|| config.publish_topic());
    check(publisher.start(&dataset, &topic).await)?;

    let mut reported = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, stopping publish job");
                check(publisher.stop())?;
            }
            _ = sleep(Duration::from_millis(250)) => {}
        }

        let status = publisher.status();
        if status.records_sent != reported {
            reported = status.records_sent;
            println!("Published {} records", status.records_sent);
        }
        if status.complete {
            match &status.last_error {
                Some(e) => error!("Publish job failed: {}", e),
                None => info!(
                    records_sent = status.records_sent,
                    rows_skipped = status.rows_skipped,
                    "Publish job complete"
                ),
            }
            break;
        }
    }

    check(supervisor.disconnect().await)?;
    Ok(())
}

async fn run_publish_random(config: TelemetryConfig, count: u32, topic: Option<String>) -> CliResult {
    let supervisor = build_supervisor(&config, Arc::new(MessageSink::in_memory()));
    connect(&config, &supervisor).await?;

    let publisher = BulkPublisher::new(Arc::clone(&supervisor), config.publish_interval());
    let topic = topic.unwrap_or_else(|| config.publish_topic());
    for i in 0..count {
        if i > 0 {
            sleep(config.publish_interval()).await;
        }
        check(publisher.publish_random(&topic).await)?;
    }

    check(supervisor.disconnect().await)?;
    Ok(())
}

fn replay_sink(config: TelemetryConfig, path: Option<PathBuf>) -> CliResult {
    let path = path.unwrap_or(config.sink.path);
    for record in read_sink_file(&path)? {
        println!("{record}");
    }
    Ok(())
}

fn handle_config_command(config: TelemetryConfig, show: bool) -> CliResult {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
        println!("Telemetry topic: {}", config.post_topic());
        println!("Property set topic: {}", config.set_topic());
    }

    info!("Configuration validation complete");
    Ok(())
}
