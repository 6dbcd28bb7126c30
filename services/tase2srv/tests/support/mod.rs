//! Shared fixtures for the tase2srv integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use tase2srv::simulator::{RecordingSink, SimNetwork, SimServer};
use tase2srv::{ClientConfig, IngestSink, Tase2Client};

pub const ADDRESS: &str = "127.0.0.1";
pub const PORT_A: u16 = 10002;
pub const PORT_B: u16 = 10003;

/// Protocol stack document with short timeouts; `groups` are `(port, tls)`.
pub fn protocol(groups: &[(u16, bool)], polling_ms: u64) -> Value {
    let connections: Vec<Value> = groups
        .iter()
        .map(|(port, tls)| json!({ "ip_addr": ADDRESS, "port": port, "tls": tls }))
        .collect();

    json!({
        "protocol_stack": {
            "name": "tase2client",
            "version": "1.0",
            "transport_layer": {
                "connections": connections,
                "backupTimeout": 300,
                "connectTimeout": 200,
                "reconnectDelay": 100,
                "failbackInterval": 200
            },
            "application_layer": {
                "polling_interval": polling_ms
            }
        }
    })
}

/// Exchanged data document from `(label, reference, typeid)` triples.
pub fn exchanged(points: &[(&str, &str, &str)]) -> Value {
    let datapoints: Vec<Value> = points
        .iter()
        .map(|(label, reference, typeid)| {
            json!({
                "label": label,
                "protocols": [{ "name": "tase2", "ref": reference, "typeid": typeid }]
            })
        })
        .collect();

    json!({ "exchanged_data": { "datapoints": datapoints } })
}

pub fn control_points() -> Value {
    exchanged(&[
        ("TC1", "icc1:Command", "Command"),
        ("TC2", "icc1:SetPointReal", "SetPointReal"),
        ("TC3", "icc1:SetPointDiscrete", "SetPointDiscrete"),
    ])
}

pub struct Harness {
    pub network: SimNetwork,
    pub sink: Arc<RecordingSink>,
    pub client: Arc<Tase2Client>,
}

impl Harness {
    /// Client plus one stopped simulated server per configured group.
    pub fn new(protocol: &Value, exchanged: &Value) -> Self {
        let config = ClientConfig::from_json(&protocol.to_string(), &exchanged.to_string(), "")
            .expect("test configuration imports");

        let network = SimNetwork::new();
        for group in &config.connections {
            network.add_server(&group.address, group.port);
        }

        let sink = Arc::new(RecordingSink::new());
        let client = Arc::new(Tase2Client::new(
            Arc::new(config),
            Arc::new(network.clone()),
            Arc::clone(&sink) as Arc<dyn IngestSink>,
        ));

        Self {
            network,
            sink,
            client,
        }
    }

    pub fn server(&self, port: u16) -> Arc<SimServer> {
        self.network
            .server(ADDRESS, port)
            .expect("server registered for every group")
    }

    pub fn active_port(&self) -> Option<u16> {
        self.client.active_connection().map(|c| c.port())
    }

    pub fn active_count(&self) -> usize {
        self.client
            .connections()
            .iter()
            .filter(|c| c.is_active())
            .count()
    }
}

pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
