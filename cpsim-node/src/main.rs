//! cpsim-node - CLI front end for the charge-point simulator engine
//!
//! # Usage
//!
//! ```bash
//! # Connect to a CSMS with defaults
//! cpsim-node --identity CP001 --csms-url ws://localhost:9000
//!
//! # Two connectors behind basic auth, starting a transaction on connect
//! cpsim-node --identity CP001 --csms-url wss://csms.example/ocpp \
//!     --connectors 2 --auth-user CP001 --auth-pass secret \
//!     --auto-start-tag TAG123
//! ```

use clap::Parser;
use cpsim_engine::{EngineEvent, Simulator, SimulatorConfig};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 charge-point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Charge-point identity, appended to the CSMS URL path
    #[arg(short, long, default_value = "CP001")]
    identity: String,

    /// CSMS WebSocket base URL
    #[arg(long, default_value = "ws://localhost:9000")]
    csms_url: String,

    /// Number of connectors
    #[arg(long, default_value = "1")]
    connectors: u32,

    /// Vendor name reported in BootNotification
    #[arg(long, default_value = "CPSim")]
    vendor: String,

    /// Model name reported in BootNotification
    #[arg(long, default_value = "CPSim-1.6")]
    model: String,

    /// Heartbeat interval in seconds (CSMS may override at boot)
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Simulated charging power in watts
    #[arg(long, default_value = "7400")]
    power_w: u32,

    /// HTTP basic auth user
    #[arg(long)]
    auth_user: Option<String>,

    /// HTTP basic auth password
    #[arg(long)]
    auth_pass: Option<String>,

    /// Start a transaction with this idTag on connector 1 once registered
    #[arg(long)]
    auto_start_tag: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let basic_auth = match (args.auth_user, args.auth_pass) {
        (Some(user), Some(pass)) => Some((user, pass)),
        (Some(_), None) | (None, Some(_)) => {
            eprintln!("--auth-user and --auth-pass must be given together");
            std::process::exit(2);
        }
        (None, None) => None,
    };

    let config = SimulatorConfig {
        csms_url: args.csms_url,
        identity: args.identity.clone(),
        vendor: args.vendor,
        model: args.model,
        basic_auth,
        connector_count: args.connectors,
        heartbeat_interval: args.heartbeat_interval,
        meter: cpsim_engine::meter::MeterConfig {
            nominal_power_w: args.power_w as f64,
            ..Default::default()
        },
        ..SimulatorConfig::default()
    };

    info!("starting charge point {}", args.identity);

    let simulator = Simulator::new(config);

    // Event feed to the console
    let mut events = simulator.subscribe();
    let event_printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("event: {:?}", event);
        }
    });

    // Optional scripted transaction once the boot handshake completes
    if let Some(id_tag) = args.auto_start_tag {
        let sim = simulator.clone();
        let mut events = simulator.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, EngineEvent::BootAccepted { .. }) {
                    match sim.start_transaction(1, &id_tag).await {
                        Ok(transaction_id) => {
                            info!("auto-started transaction {}", transaction_id)
                        }
                        Err(e) => warn!("auto-start failed: {}", e),
                    }
                    break;
                }
            }
        });
    }

    let runner = simulator.clone();
    let run_result = tokio::select! {
        result = runner.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            simulator.disconnect();
            Ok(())
        }
    };

    event_printer.abort();
    run_result?;
    Ok(())
}
