//! Bridge configuration
//!
//! Three JSON documents describe a deployment:
//!
//! - `protocol_stack`: redundancy groups, timing, datasets and transfer sets
//! - `exchanged_data`: the points exchanged with the peer
//! - `tls_conf`: certificate file names
//!
//! Each import replaces the content it owns. A document that fails to parse,
//! or whose sections or scalar settings have the wrong type, is rejected as a
//! whole and leaves the current content untouched. Individual bad entries
//! (invalid address, unknown point type, malformed dataset or transfer set)
//! are logged and skipped.

pub mod exchange;
pub mod osi;
pub mod settings;

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::endpoint::{DataSetHandle, DsConditions, TransferSetParams};
use crate::error::{Result, Tase2Error};
use crate::tls::{CertStore, TlsSettings};

pub use exchange::{split_reference, ExchangeDefinition, ExchangeTable, PointType, ValueRepr};
pub use osi::OsiParameters;

pub const DEFAULT_PORT: u16 = 102;
pub const DEFAULT_DATASET_DOMAIN: &str = "vcc";
pub const DEFAULT_BACKUP_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_FAILBACK_INTERVAL: Duration = Duration::from_millis(10_000);

const PROTOCOL_TASE2: &str = "tase2";

/// One candidate server endpoint; configured order is failover priority
#[derive(Debug, Clone, PartialEq)]
pub struct RedundancyGroup {
    pub address: String,
    pub port: u16,
    pub tls: bool,
    pub osi: Option<OsiParameters>,
}

/// Named set of point names scoped to a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub domain: String,
    pub name: String,
    pub entries: Vec<String>,
    /// Created on the peer after every connect when true
    pub dynamic: bool,
}

impl Dataset {
    /// Map key: `domain:name`
    pub fn key(&self) -> String {
        format!("{}:{}", self.domain, self.name)
    }

    /// Point references (`domain:entry`) covered by this dataset
    pub fn entry_refs(&self) -> impl Iterator<Item = String> + '_ {
        self.entries.iter().map(move |e| format!("{}:{}", self.domain, e))
    }
}

/// Report subscription bound to one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetTransferSet {
    pub domain: String,
    pub name: String,
    pub dataset_ref: String,
    /// Domain of the bound dataset, resolved at import
    pub dataset_domain: String,
    pub conditions: DsConditions,
    pub start_time: u32,
    pub interval: u32,
    pub tle: u32,
    pub buffer_time: u32,
    pub integrity_check: u32,
    pub critical: bool,
    pub rbe: bool,
    pub all_changes_reported: bool,
}

impl DatasetTransferSet {
    /// Values written to the peer to arm this subscription.
    pub fn params(&self, data_set: DataSetHandle) -> TransferSetParams {
        TransferSetParams {
            data_set,
            start_time: self.start_time,
            interval: self.interval,
            tle: self.tle,
            buffer_time: self.buffer_time,
            integrity_check: self.integrity_check,
            conditions: self.conditions,
            critical: self.critical,
            rbe: self.rbe,
            all_changes_reported: self.all_changes_reported,
            enabled: true,
        }
    }
}

/// Complete client configuration, shared read-only once the client starts
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connections: Vec<RedundancyGroup>,
    pub backup_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub failback: bool,
    pub failback_interval: Duration,
    /// Zero disables polling
    pub polling_interval: Duration,
    pub datasets: BTreeMap<String, Dataset>,
    pub transfer_sets: BTreeMap<String, DatasetTransferSet>,
    pub exchange: ExchangeTable,
    pub tls: TlsSettings,
    pub data_dir: PathBuf,
    polled: BTreeMap<String, Arc<ExchangeDefinition>>,
    protocol_complete: bool,
    exchange_complete: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            backup_timeout: DEFAULT_BACKUP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            failback: true,
            failback_interval: DEFAULT_FAILBACK_INTERVAL,
            polling_interval: Duration::ZERO,
            datasets: BTreeMap::new(),
            transfer_sets: BTreeMap::new(),
            exchange: ExchangeTable::new(),
            tls: TlsSettings::default(),
            data_dir: PathBuf::from("."),
            polled: BTreeMap::new(),
            protocol_complete: false,
            exchange_complete: false,
        }
    }
}

// ============================================================================
// Protocol stack document
// ============================================================================

#[derive(Debug, Deserialize)]
struct ProtocolDocument {
    protocol_stack: Option<ProtocolStackSection>,
}

#[derive(Debug, Deserialize)]
struct ProtocolStackSection {
    #[serde(default)]
    name: Option<String>,
    transport_layer: Option<TransportLayerSection>,
    application_layer: Option<ApplicationLayerSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransportLayerSection {
    connections: Option<Vec<ConnectionSection>>,
    backup_timeout: Option<u64>,
    connect_timeout: Option<u64>,
    reconnect_delay: Option<u64>,
    failback: Option<bool>,
    failback_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ConnectionSection {
    ip_addr: Option<String>,
    port: Option<i64>,
    tls: Option<Value>,
    osi: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApplicationLayerSection {
    polling_interval: Option<i64>,
    #[serde(default)]
    datasets: Vec<Value>,
    #[serde(default)]
    dataset_transfer_sets: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct DatasetSection {
    #[serde(default)]
    domain: Option<String>,
    dataset_ref: String,
    #[serde(default)]
    entries: Vec<Value>,
    dynamic: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferSetSection {
    #[serde(default)]
    domain: String,
    name: String,
    #[serde(default, rename = "dataset_ref")]
    dataset_ref: String,
    #[serde(default)]
    ds_conditions: Vec<String>,
    #[serde(default)]
    start_time: u32,
    #[serde(default)]
    interval: u32,
    #[serde(default)]
    tle: u32,
    #[serde(default, rename = "bufTm")]
    buffer_time: u32,
    #[serde(default)]
    integrity_check: u32,
    #[serde(default)]
    critical: bool,
    #[serde(default)]
    rbe: bool,
    #[serde(default)]
    all_changes_reported: bool,
}

// ============================================================================
// Exchanged data document
// ============================================================================

#[derive(Debug, Deserialize)]
struct ExchangeDocument {
    exchanged_data: ExchangedDataSection,
}

#[derive(Debug, Deserialize)]
struct ExchangedDataSection {
    datapoints: Vec<DatapointSection>,
}

#[derive(Debug, Deserialize)]
struct DatapointSection {
    label: String,
    protocols: Vec<ProtocolSection>,
}

#[derive(Debug, Deserialize)]
struct ProtocolSection {
    name: String,
    #[serde(rename = "ref")]
    reference: String,
    typeid: String,
}

#[derive(Debug, Deserialize)]
struct TlsDocument {
    tls_conf: TlsSettings,
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the three documents.
    pub fn from_json(protocol: &str, exchanged: &str, tls: &str) -> Result<Self> {
        let mut config = Self::new();
        config.import_protocol_config(protocol)?;
        config.import_exchange_config(exchanged)?;
        if !tls.trim().is_empty() {
            config.import_tls_config(tls)?;
        }
        Ok(config)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn cert_store(&self) -> CertStore {
        CertStore::for_data_dir(Path::new(&self.data_dir))
    }

    pub fn protocol_complete(&self) -> bool {
        self.protocol_complete
    }

    pub fn exchange_complete(&self) -> bool {
        self.exchange_complete
    }

    /// Import the `protocol_stack` document.
    pub fn import_protocol_config(&mut self, json: &str) -> Result<()> {
        self.protocol_complete = false;

        let document: ProtocolDocument = serde_json::from_str(json).map_err(|e| {
            error!("Wrong data type in protocol stack configuration: {}", e);
            Tase2Error::config(format!("protocol stack: {}", e))
        })?;

        let stack = document
            .protocol_stack
            .ok_or_else(|| Tase2Error::config("protocol_stack section is missing"))?;
        let transport = stack.transport_layer.ok_or_else(|| {
            error!("Transport layer configuration is missing");
            Tase2Error::config("transport layer configuration is missing")
        })?;
        let entries = transport.connections.ok_or_else(|| {
            error!("No connections are configured");
            Tase2Error::config("no connections are configured")
        })?;

        let mut connections = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(group) = parse_connection(entry)? {
                connections.push(group);
            }
        }

        let mut polling_interval = Duration::ZERO;
        let mut datasets = BTreeMap::new();
        let mut transfer_sets = BTreeMap::new();

        match stack.application_layer {
            Some(app) => {
                match app.polling_interval {
                    Some(ms) if ms < 0 => {
                        error!("polling_interval must be positive, polling disabled");
                    },
                    Some(ms) => polling_interval = Duration::from_millis(ms as u64),
                    None => {},
                }

                for value in app.datasets {
                    if let Some(dataset) = parse_dataset(value) {
                        if let Some(old) = datasets.insert(dataset.key(), dataset) {
                            warn!("Dataset {} defined twice, last definition kept", old.key());
                        }
                    }
                }

                for value in app.dataset_transfer_sets {
                    if let Some(mut dsts) = parse_transfer_set(value) {
                        if bind_data_set(&mut dsts, &datasets) {
                            transfer_sets.insert(dsts.name.clone(), dsts);
                        }
                    }
                }
            },
            None => warn!("Application layer configuration is missing, no polling or reports"),
        }

        self.connections = connections;
        self.backup_timeout = millis(transport.backup_timeout, DEFAULT_BACKUP_TIMEOUT);
        self.connect_timeout = millis(transport.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        self.reconnect_delay = millis(transport.reconnect_delay, DEFAULT_RECONNECT_DELAY);
        self.failback = transport.failback.unwrap_or(true);
        self.failback_interval = millis(transport.failback_interval, DEFAULT_FAILBACK_INTERVAL);
        self.polling_interval = polling_interval;
        self.datasets = datasets;
        self.transfer_sets = transfer_sets;
        self.refresh_polled();
        self.protocol_complete = true;

        info!(
            "Protocol stack {} imported: {} connections, {} datasets, {} transfer sets",
            stack.name.as_deref().unwrap_or("<unnamed>"),
            self.connections.len(),
            self.datasets.len(),
            self.transfer_sets.len()
        );
        Ok(())
    }

    /// Import the `exchanged_data` document.
    pub fn import_exchange_config(&mut self, json: &str) -> Result<()> {
        self.exchange_complete = false;

        let document: ExchangeDocument = serde_json::from_str(json).map_err(|e| {
            error!("Parsing error in data exchange configuration: {}", e);
            Tase2Error::config(format!("exchanged data: {}", e))
        })?;

        let mut table = ExchangeTable::new();
        for datapoint in document.exchanged_data.datapoints {
            for protocol in datapoint.protocols {
                if protocol.name != PROTOCOL_TASE2 {
                    continue;
                }

                let point_type = match protocol.typeid.parse::<PointType>() {
                    Ok(t) => t,
                    Err(_) => {
                        error!(
                            "Invalid datapoint type label: {}, type: {}",
                            datapoint.label, protocol.typeid
                        );
                        continue;
                    },
                };

                let label = datapoint.label.clone();
                match ExchangeDefinition::new(protocol.reference, label, point_type) {
                    Ok(def) => {
                        debug!("Add dp to exchange definitions {}", def.reference);
                        table.insert(def);
                    },
                    Err(e) => warn!("Datapoint {} skipped: {}", datapoint.label, e),
                }
            }
        }

        self.exchange = table;
        self.refresh_polled();
        self.exchange_complete = true;
        info!("Exchanged data imported: {} datapoints", self.exchange.len());
        Ok(())
    }

    /// Import the `tls_conf` document.
    pub fn import_tls_config(&mut self, json: &str) -> Result<()> {
        let document: TlsDocument = serde_json::from_str(json).map_err(|e| {
            error!("Parsing error in TLS configuration: {}", e);
            Tase2Error::config(format!("tls: {}", e))
        })?;
        self.tls = document.tls_conf;
        Ok(())
    }

    /// Monitoring points not delivered by any dataset.
    fn refresh_polled(&mut self) {
        let reported: HashSet<String> =
            self.datasets.values().flat_map(Dataset::entry_refs).collect();

        self.polled = self
            .exchange
            .iter()
            .filter(|def| def.point_type.is_monitoring() && !reported.contains(&def.reference))
            .map(|def| (def.reference.clone(), Arc::clone(def)))
            .collect();
    }

    pub fn polled_points(&self) -> impl Iterator<Item = &Arc<ExchangeDefinition>> {
        self.polled.values()
    }

    pub fn is_polled(&self, reference: &str) -> bool {
        self.polled.contains_key(reference)
    }

    pub fn definition_by_ref(&self, reference: &str) -> Option<&Arc<ExchangeDefinition>> {
        self.exchange.by_ref(reference)
    }

    pub fn definition_by_label(&self, label: &str) -> Option<&Arc<ExchangeDefinition>> {
        self.exchange.by_label(label)
    }
}

fn parse_connection(entry: ConnectionSection) -> Result<Option<RedundancyGroup>> {
    let Some(address) = entry.ip_addr else {
        warn!("Connection without ip_addr skipped");
        return Ok(None);
    };
    if address.parse::<IpAddr>().is_err() {
        error!("Invalid Ip address {}", address);
        return Ok(None);
    }

    let port = match entry.port {
        None => DEFAULT_PORT,
        Some(p) => match u16::try_from(p) {
            Ok(p) if p > 0 => p,
            _ => {
                error!("Invalid port {}", p);
                return Ok(None);
            },
        },
    };

    let tls = match entry.tls {
        None => false,
        Some(Value::Bool(b)) => b,
        Some(_) => {
            warn!("connection.tls has invalid type -> not using TLS");
            false
        },
    };

    let osi = entry.osi.as_ref().map(OsiParameters::from_json).transpose()?;

    Ok(Some(RedundancyGroup {
        address,
        port,
        tls,
        osi,
    }))
}

fn parse_dataset(value: Value) -> Option<Dataset> {
    let section: DatasetSection = match serde_json::from_value(value) {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid dataset definition skipped: {}", e);
            return None;
        },
    };

    let entries = section
        .entries
        .into_iter()
        .filter_map(|e| match e {
            Value::String(s) => Some(s),
            other => {
                warn!("Dataset {} entry {} is not a string", section.dataset_ref, other);
                None
            },
        })
        .collect();

    let dynamic = section.dynamic.unwrap_or_else(|| {
        warn!(
            "Dataset {} has no dynamic value -> defaulting to static",
            section.dataset_ref
        );
        false
    });

    Some(Dataset {
        domain: section
            .domain
            .unwrap_or_else(|| DEFAULT_DATASET_DOMAIN.to_string()),
        name: section.dataset_ref,
        entries,
        dynamic,
    })
}

fn parse_transfer_set(value: Value) -> Option<DatasetTransferSet> {
    let section: TransferSetSection = match serde_json::from_value(value) {
        Ok(s) => s,
        Err(e) => {
            error!("Invalid dataset transfer set skipped: {}", e);
            return None;
        },
    };

    let conditions = section
        .ds_conditions
        .iter()
        .filter_map(|name| {
            let cond = DsConditions::from_name(name);
            if cond.is_none() {
                warn!("Transfer set {}: unknown condition {}", section.name, name);
            }
            cond
        })
        .fold(DsConditions::NONE, |acc, c| acc | c);

    Some(DatasetTransferSet {
        domain: section.domain,
        name: section.name,
        dataset_ref: section.dataset_ref,
        dataset_domain: String::new(),
        conditions,
        start_time: section.start_time,
        interval: section.interval,
        tle: section.tle,
        buffer_time: section.buffer_time,
        integrity_check: section.integrity_check,
        critical: section.critical,
        rbe: section.rbe,
        all_changes_reported: section.all_changes_reported,
    })
}

/// Resolve the dataset of a transfer set. A dataset in the transfer set's
/// own domain wins, then a dataset with that name in exactly one domain.
/// Returns `false` when the transfer set cannot be armed.
fn bind_data_set(dsts: &mut DatasetTransferSet, datasets: &BTreeMap<String, Dataset>) -> bool {
    if dsts.dataset_ref.is_empty() {
        error!("Transfer set {} has no dataset_ref, skipped", dsts.name);
        return false;
    }

    let dataset = match datasets.get(&format!("{}:{}", dsts.domain, dsts.dataset_ref)) {
        Some(ds) => Some(ds),
        None => {
            let mut named = datasets.values().filter(|ds| ds.name == dsts.dataset_ref);
            match (named.next(), named.next()) {
                (Some(_), Some(_)) => {
                    error!(
                        "Transfer set {}: dataset {} exists in several domains, skipped",
                        dsts.name, dsts.dataset_ref
                    );
                    return false;
                },
                (first, _) => first,
            }
        },
    };

    match dataset {
        Some(ds) => {
            dsts.dataset_domain = ds.domain.clone();
            if dsts.domain.is_empty() {
                dsts.domain = ds.domain.clone();
            }
            true
        },
        None if dsts.domain.is_empty() => {
            error!(
                "Transfer set {} has no domain and unknown dataset {}, skipped",
                dsts.name, dsts.dataset_ref
            );
            false
        },
        // static dataset not listed in the configuration
        None => {
            dsts.dataset_domain = dsts.domain.clone();
            true
        },
    }
}

#[cfg(test)]
mod tests;
