//! Host-facing facade
//!
//! Wraps configuration import, client lifecycle and the operation entry
//! point used by the host to send commands and set points.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::client::Tase2Client;
use crate::config::{ClientConfig, PointType};
use crate::dispatch::IngestSink;
use crate::endpoint::EndpointFactory;
use crate::error::{Result, Tase2Error};
use crate::reading::Reading;

pub const DEFAULT_ASSET_NAME: &str = "tase2client";
pub const COMMAND_OPERATION: &str = "TASE2Command";

/// Named operation parameter as passed by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginParameter {
    pub name: String,
    pub value: String,
}

impl PluginParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Positions in a `TASE2Command` parameter list
mod param {
    pub const TYPE: usize = 0;
    pub const DOMAIN: usize = 2;
    pub const NAME: usize = 3;
    pub const VALUE: usize = 4;
    pub const SELECT: usize = 5;
    pub const TS: usize = 6;
    pub const COUNT: usize = 7;
}

type IngestSlot = Arc<RwLock<Option<Arc<dyn IngestSink>>>>;

/// Forwards readings to whatever sink is registered at the time.
struct IngestRelay {
    slot: IngestSlot,
}

impl IngestSink for IngestRelay {
    fn ingest(&self, reading: Reading) {
        let sink = self.slot.read().clone();
        match sink {
            Some(sink) => sink.ingest(reading),
            None => debug!("No ingest callback registered, {} dropped", reading.asset),
        }
    }
}

pub struct Tase2Plugin {
    factory: Arc<dyn EndpointFactory>,
    asset_name: RwLock<String>,
    data_dir: RwLock<PathBuf>,
    config: RwLock<Option<Arc<ClientConfig>>>,
    ingest: IngestSlot,
    client: Mutex<Option<Arc<Tase2Client>>>,
}

impl Tase2Plugin {
    pub fn new(factory: Arc<dyn EndpointFactory>) -> Self {
        Self {
            factory,
            asset_name: RwLock::new(DEFAULT_ASSET_NAME.to_string()),
            data_dir: RwLock::new(PathBuf::new()),
            config: RwLock::new(None),
            ingest: Arc::new(RwLock::new(None)),
            client: Mutex::new(None),
        }
    }

    pub fn set_asset_name(&self, name: impl Into<String>) {
        *self.asset_name.write() = name.into();
    }

    pub fn asset_name(&self) -> String {
        self.asset_name.read().clone()
    }

    /// Root of `etc/certs`, applied at the next configuration import.
    pub fn set_data_dir(&self, data_dir: impl Into<PathBuf>) {
        *self.data_dir.write() = data_dir.into();
    }

    pub fn register_ingest(&self, sink: Arc<dyn IngestSink>) {
        *self.ingest.write() = Some(sink);
    }

    pub fn config(&self) -> Option<Arc<ClientConfig>> {
        self.config.read().clone()
    }

    pub fn client(&self) -> Option<Arc<Tase2Client>> {
        self.client.lock().clone()
    }

    /// Import the three documents. Every document is attempted; whatever
    /// imported cleanly is kept and the first failure is returned.
    pub fn set_json_config(&self, protocol: &str, exchanged: &str, tls: &str) -> Result<()> {
        let mut config = ClientConfig::new().with_data_dir(self.data_dir.read().clone());

        let protocol_result = config.import_protocol_config(protocol);
        let exchange_result = config.import_exchange_config(exchanged);
        let tls_result = if tls.trim().is_empty() {
            Ok(())
        } else {
            config.import_tls_config(tls)
        };

        *self.config.write() = Some(Arc::new(config));
        protocol_result.and(exchange_result).and(tls_result)
    }

    /// Start the client; needs a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut client = self.client.lock();
        if client.is_some() {
            warn!("{} already started", self.asset_name());
            return Ok(());
        }

        let config = self
            .config()
            .ok_or_else(|| Tase2Error::config("no configuration loaded"))?;
        if !config.protocol_complete() {
            return Err(Tase2Error::config("protocol stack configuration is incomplete"));
        }

        info!("Starting {}", self.asset_name());
        let relay = Arc::new(IngestRelay {
            slot: Arc::clone(&self.ingest),
        });
        let started = Arc::new(Tase2Client::new(config, Arc::clone(&self.factory), relay));
        started.start();
        *client = Some(started);
        Ok(())
    }

    pub async fn stop(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            client.stop().await;
            info!("{} stopped", self.asset_name());
        }
    }

    /// Stop, import the new documents and restart if it was running.
    pub async fn reconfigure(&self, protocol: &str, exchanged: &str, tls: &str) -> Result<()> {
        let running = self.client.lock().is_some();
        self.stop().await;
        let imported = self.set_json_config(protocol, exchanged, tls);
        if running {
            self.start()?;
        }
        imported
    }

    /// Send one control action. `kind` is `Command`, `SetPointReal` or
    /// `SetPointDiscrete`.
    pub async fn operate(
        &self,
        kind: &str,
        domain: &str,
        name: &str,
        value: f64,
        select: bool,
        timestamp: i64,
    ) -> bool {
        let Some(client) = self.client() else {
            error!("Operation called but plugin is not yet initialized");
            return false;
        };

        match kind.parse::<PointType>() {
            Ok(PointType::Command) => {
                client
                    .send_command(domain, name, value as i32, select, timestamp)
                    .await
            },
            Ok(PointType::SetPointReal) => {
                client
                    .send_set_point_real(domain, name, value as f32, select, timestamp)
                    .await
            },
            Ok(PointType::SetPointDiscrete) => {
                client
                    .send_set_point_discrete(domain, name, value as i32, select, timestamp)
                    .await
            },
            _ => {
                error!("Unrecognised command type {}", kind);
                false
            },
        }
    }

    /// Host operation entry point.
    ///
    /// `TASE2Command` expects `[type, scope, domain, name, value, select, ts]`.
    pub async fn operation(&self, operation: &str, params: &[PluginParameter]) -> bool {
        if self.client().is_none() {
            error!("Operation called but plugin is not yet initialized");
            return false;
        }
        if operation != COMMAND_OPERATION {
            error!("Unrecognised operation {}", operation);
            return false;
        }
        if params.len() < param::COUNT {
            error!("Operation parameter missing");
            return false;
        }

        let kind = unquote(&params[param::TYPE].value);
        let domain = &params[param::DOMAIN].value;
        let name = &params[param::NAME].value;
        let raw_value = &params[param::VALUE].value;

        let value = match kind {
            "SetPointReal" => raw_value.trim().parse::<f64>().ok(),
            _ => leading_int(raw_value).map(f64::from),
        };
        let Some(value) = value else {
            error!("Invalid value '{}' for {}:{}", raw_value, domain, name);
            return false;
        };
        let select = leading_int(&params[param::SELECT].value).is_some_and(|v| v != 0);
        let Ok(timestamp) = params[param::TS].value.trim().parse::<i64>() else {
            error!("Invalid timestamp '{}'", params[param::TS].value);
            return false;
        };

        debug!(
            "operate: {} - Domain: {} Name: {} value: {} select: {} timestamp: {}",
            kind, domain, name, value, select, timestamp
        );
        self.operate(kind, domain, name, value, select, timestamp)
            .await
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
}

/// Integer prefix of `raw`, so `"1.2"` reads as 1.
fn leading_int(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let end = raw
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(raw.len(), |(i, _)| i);
    raw[..end].parse().ok()
}
