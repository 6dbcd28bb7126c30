//! TASE.2 bridge service (`tase2srv`)
//!
//! Loads the service settings and the three configuration documents,
//! starts the redundant TASE.2 client and logs every ingested reading
//! until Ctrl+C or SIGTERM.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use common::LogConfig;
use tase2srv::config::settings::ServiceSettings;
use tase2srv::config::{ClientConfig, PointType};
use tase2srv::dispatch::now_ms;
use tase2srv::plugin::Tase2Plugin;
use tase2srv::simulator::{SimNetwork, SimServer};
use tase2srv::{PointValue, Reading};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tase2srv",
    version = env!("CARGO_PKG_VERSION"),
    about = "TASE.2/ICCP client data-acquisition bridge",
    long_about = None
)]
struct Args {
    /// Settings file (YAML, TOML or JSON)
    #[arg(short = 'c', long, env = "TASE2SRV_SETTINGS")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), overrides the settings file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only import the configuration documents and exit
    #[arg(long)]
    validate: bool,

    /// Serve every configured redundancy group from in-process simulated peers
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = ServiceSettings::load(args.config.as_deref())?;
    if let Some(base) = args.config.as_deref().and_then(Path::parent) {
        settings = settings.resolve_relative_to(base);
    }
    if let Some(level) = args.log_level.clone() {
        settings.logging.level = level;
    }

    common::init_with_config(LogConfig {
        service_name: "tase2srv".to_string(),
        level: settings.logging.level.clone(),
        log_dir: settings.logging.dir.clone(),
        enable_json: settings.logging.json,
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    info!(
        "tase2srv {} starting, log filter: {}",
        env!("CARGO_PKG_VERSION"),
        common::current_log_level().unwrap_or_else(|| settings.logging.level.clone())
    );

    let protocol = read_document(&settings.protocol_stack)?;
    let exchanged = read_document(&settings.exchanged_data)?;
    let tls = match &settings.tls_conf {
        Some(path) => read_document(path)?,
        None => String::new(),
    };

    if args.validate {
        let config = ClientConfig::from_json(&protocol, &exchanged, &tls)?;
        info!(
            "Configuration valid: {} redundancy groups, {} datapoints ({} polled), {} datasets, {} transfer sets",
            config.connections.len(),
            config.exchange.len(),
            config.polled_points().count(),
            config.datasets.len(),
            config.transfer_sets.len()
        );
        return Ok(());
    }

    if !args.simulate {
        bail!("no native TASE.2 protocol backend in this build, run with --simulate");
    }

    let network = SimNetwork::new();
    let plugin = Tase2Plugin::new(Arc::new(network.clone()));
    plugin.set_asset_name(settings.asset.clone());
    plugin.set_data_dir(settings.data_dir.clone());
    if let Err(e) = plugin.set_json_config(&protocol, &exchanged, &tls) {
        error!("Configuration import incomplete: {}", e);
    }
    plugin.register_ingest(Arc::new(|reading: Reading| {
        info!(target: "tase2srv::ingest", "{}", reading.to_json());
    }));

    let config = plugin.config().context("no configuration imported")?;
    let token = common::shutdown_token();
    let servers = start_simulated_peers(&network, &config);
    let feeder = tokio::spawn(feed_simulated_values(
        servers,
        Arc::clone(&config),
        token.clone(),
    ));

    plugin.start()?;
    token.cancelled().await;

    info!("Shutting down {}", plugin.asset_name());
    plugin.stop().await;
    feeder.await?;
    Ok(())
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// One running peer per redundancy group, with the static datasets.
fn start_simulated_peers(network: &SimNetwork, config: &ClientConfig) -> Vec<Arc<SimServer>> {
    config
        .connections
        .iter()
        .map(|group| {
            let server = network.add_server(&group.address, group.port);
            for ds in config.datasets.values().filter(|ds| !ds.dynamic) {
                let members: Vec<String> = ds.entry_refs().collect();
                let members: Vec<&str> = members.iter().map(String::as_str).collect();
                server.add_data_set(&ds.domain, &ds.name, &members);
            }
            server.start();
            server
        })
        .collect()
}

async fn feed_simulated_values(
    servers: Vec<Arc<SimServer>>,
    config: Arc<ClientConfig>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut step: u32 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {},
        }

        step = step.wrapping_add(1);
        for def in config.exchange.iter().filter(|d| d.point_type.is_monitoring()) {
            let value = simulated_value(def.point_type, step);
            for server in &servers {
                server.set_point(&def.reference, value.clone());
            }
        }
        debug!("Simulated step {} applied", step);
    }
}

fn simulated_value(point_type: PointType, step: u32) -> PointValue {
    let value = match point_type.index() / 4 {
        0 => PointValue::real(step as f32 * 0.5),
        1 => PointValue::state((step % 4) as u8),
        2 => PointValue::discrete(step as i32),
        _ => PointValue::state_supplemental((step % 4) as u8),
    };

    if point_type.has_timestamp() {
        value.with_timestamp(now_ms())
    } else {
        value
    }
}
