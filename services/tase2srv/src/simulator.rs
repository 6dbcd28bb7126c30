//! In-memory TASE.2 peer simulator
//!
//! [`SimNetwork`] is an [`EndpointFactory`] resolving `address:port` to
//! registered [`SimServer`]s. Servers can be started and stopped at any
//! time to exercise connect, loss, failover and fail-back paths without a
//! real MMS stack. [`RecordingSink`] collects the readings that reach the
//! ingest side.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::exchange::split_reference;
use crate::connection::ControlValue;
use crate::dispatch::IngestSink;
use crate::endpoint::{
    ClientError, ClientResult, DataSetHandle, Endpoint, EndpointFactory, EndpointSettings,
    EndpointState, PointValue, ReportHandler, TransferSetHandle, TransferSetParams,
};
use crate::error::{Result, Tase2Error};
use crate::reading::Reading;

/// Ingest sink keeping every reading in memory
#[derive(Default)]
pub struct RecordingSink {
    readings: Mutex<Vec<Reading>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.readings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.lock().is_empty()
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings.lock().clone()
    }

    pub fn clear(&self) {
        self.readings.lock().clear();
    }

    /// Number of readings for asset `label`
    pub fn count_for(&self, label: &str) -> usize {
        self.readings
            .lock()
            .iter()
            .filter(|r| r.asset == label)
            .count()
    }
}

impl IngestSink for RecordingSink {
    fn ingest(&self, reading: Reading) {
        self.readings.lock().push(reading);
    }
}

/// Control request received by a simulated server
#[derive(Debug, Clone, PartialEq)]
pub enum SimControl {
    Select(String),
    Operate(String, ControlValue),
}

struct ArmedTransferSet {
    owner: u64,
    data_set: String,
    params: TransferSetParams,
    handler: Option<Arc<dyn ReportHandler>>,
}

/// Simulated TASE.2 server
pub struct SimServer {
    address: String,
    port: u16,
    running: AtomicBool,
    generation: AtomicU64,
    points: Mutex<HashMap<String, PointValue>>,
    data_sets: Mutex<HashMap<String, Vec<String>>>,
    transfer_sets: Mutex<HashMap<String, ArmedTransferSet>>,
    associations: Mutex<HashSet<u64>>,
    controls: Mutex<Vec<SimControl>>,
    reject_controls: AtomicBool,
    transfer_set_counter: AtomicU32,
    report_sequence: AtomicU32,
}

impl SimServer {
    fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            points: Mutex::new(HashMap::new()),
            data_sets: Mutex::new(HashMap::new()),
            transfer_sets: Mutex::new(HashMap::new()),
            associations: Mutex::new(HashSet::new()),
            controls: Mutex::new(Vec::new()),
            reject_controls: AtomicBool::new(false),
            transfer_set_counter: AtomicU32::new(0),
            report_sequence: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.running.store(true, Ordering::Release);
        info!("simulated server {}:{} started", self.address, self.port);
    }

    /// Stop accepting and drop every association.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.transfer_sets.lock().clear();
        self.associations.lock().clear();
        info!("simulated server {}:{} stopped", self.address, self.port);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Update a point and report it through every armed transfer set
    /// whose dataset contains it. Returns the number of reports sent.
    pub fn set_point(&self, reference: &str, value: PointValue) -> usize {
        self.points.lock().insert(reference.to_string(), value.clone());

        let handlers: Vec<(String, Arc<dyn ReportHandler>)> = {
            let data_sets = self.data_sets.lock();
            self.transfer_sets
                .lock()
                .iter()
                .filter(|(_, ts)| {
                    data_sets
                        .get(&ts.data_set)
                        .is_some_and(|entries| entries.iter().any(|e| e == reference))
                })
                .filter_map(|(name, ts)| ts.handler.clone().map(|h| (name.clone(), h)))
                .collect()
        };

        let Some((domain, name)) = split_reference(reference) else {
            return 0;
        };
        for (ts_name, handler) in &handlers {
            let sequence = self.report_sequence.fetch_add(1, Ordering::AcqRel);
            handler.on_report_lifecycle(ts_name, false, sequence);
            handler.on_point_value(domain, name, value.clone());
            handler.on_report_lifecycle(ts_name, true, sequence);
        }
        handlers.len()
    }

    pub fn add_data_set(&self, domain: &str, name: &str, entries: &[&str]) {
        self.data_sets.lock().insert(
            format!("{}:{}", domain, name),
            entries.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub fn has_data_set(&self, domain: &str, name: &str) -> bool {
        self.data_sets
            .lock()
            .contains_key(&format!("{}:{}", domain, name))
    }

    pub fn armed_transfer_sets(&self) -> usize {
        self.transfer_sets.lock().len()
    }

    /// Parameters last written to each armed transfer set
    pub fn transfer_set_params(&self) -> Vec<TransferSetParams> {
        self.transfer_sets
            .lock()
            .values()
            .map(|ts| ts.params.clone())
            .collect()
    }

    pub fn association_count(&self) -> usize {
        self.associations.lock().len()
    }

    pub fn controls(&self) -> Vec<SimControl> {
        self.controls.lock().clone()
    }

    pub fn set_reject_controls(&self, reject: bool) {
        self.reject_controls.store(reject, Ordering::Release);
    }

    fn release_owner(&self, owner: u64) {
        self.transfer_sets.lock().retain(|_, ts| ts.owner != owner);
        self.associations.lock().remove(&owner);
    }

    fn control(&self, control: SimControl) -> ClientResult<()> {
        if self.reject_controls.load(Ordering::Acquire) {
            return Err(ClientError::Rejected);
        }
        self.controls.lock().push(control);
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    servers: RwLock<HashMap<(String, u16), Arc<SimServer>>>,
    fail_creation: AtomicBool,
    endpoint_counter: AtomicU64,
    created: AtomicUsize,
}

/// Registry of simulated servers, usable as an [`EndpointFactory`]
#[derive(Default, Clone)]
pub struct SimNetwork {
    inner: Arc<NetworkInner>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stopped server at `address:port`.
    pub fn add_server(&self, address: &str, port: u16) -> Arc<SimServer> {
        let server = Arc::new(SimServer::new(address, port));
        self.inner
            .servers
            .write()
            .insert((address.to_string(), port), Arc::clone(&server));
        server
    }

    pub fn server(&self, address: &str, port: u16) -> Option<Arc<SimServer>> {
        self.inner
            .servers
            .read()
            .get(&(address.to_string(), port))
            .cloned()
    }

    /// Make every following `create` call fail.
    pub fn fail_endpoint_creation(&self, fail: bool) {
        self.inner.fail_creation.store(fail, Ordering::Release);
    }

    pub fn endpoints_created(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }
}

impl EndpointFactory for SimNetwork {
    fn create(&self, settings: EndpointSettings) -> Result<Box<dyn Endpoint>> {
        if self.inner.fail_creation.load(Ordering::Acquire) {
            return Err(Tase2Error::endpoint(format!(
                "cannot create endpoint for {}:{}",
                settings.address, settings.port
            )));
        }

        let id = self.inner.endpoint_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.created.fetch_add(1, Ordering::AcqRel);
        let server = self.server(&settings.address, settings.port);
        debug!(
            "simulated endpoint {} for {}:{} (tls: {})",
            id,
            settings.address,
            settings.port,
            settings.tls.is_some()
        );

        Ok(Box::new(SimEndpoint {
            id,
            server,
            session: Mutex::new(EndpointSession {
                state: EndpointState::Idle,
                generation: 0,
                handler: None,
            }),
        }))
    }
}

struct EndpointSession {
    state: EndpointState,
    generation: u64,
    handler: Option<Arc<dyn ReportHandler>>,
}

/// Association with a [`SimServer`]
///
/// An unknown address never completes connecting; a registered but
/// stopped server refuses the connect.
struct SimEndpoint {
    id: u64,
    server: Option<Arc<SimServer>>,
    session: Mutex<EndpointSession>,
}

impl SimEndpoint {
    fn live(&self) -> ClientResult<&Arc<SimServer>> {
        if self.state() != EndpointState::Connected {
            return Err(ClientError::NotConnected);
        }
        self.server.as_ref().ok_or(ClientError::NotConnected)
    }
}

#[async_trait]
impl Endpoint for SimEndpoint {
    fn state(&self) -> EndpointState {
        let mut session = self.session.lock();
        let Some(server) = &self.server else {
            return session.state;
        };

        match session.state {
            EndpointState::Connecting if server.is_running() => {
                session.state = EndpointState::Connected;
                session.generation = server.generation();
                server.associations.lock().insert(self.id);
            },
            EndpointState::Connected
                if !server.is_running() || server.generation() != session.generation =>
            {
                session.state = EndpointState::Idle;
                server.release_owner(self.id);
            },
            _ => {},
        }
        session.state
    }

    async fn connect(&self) -> ClientResult<()> {
        if let Some(server) = &self.server {
            if !server.is_running() {
                return Err(ClientError::Failed("connection refused".to_string()));
            }
        }
        self.session.lock().state = EndpointState::Connecting;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut session = self.session.lock();
        session.state = EndpointState::Idle;
        session.handler = None;
        if let Some(server) = &self.server {
            server.release_owner(self.id);
        }
    }

    async fn read_point_value(&self, domain: &str, name: &str) -> ClientResult<PointValue> {
        let server = self.live()?;
        server
            .points
            .lock()
            .get(&format!("{}:{}", domain, name))
            .cloned()
            .ok_or(ClientError::ObjectNotFound)
    }

    async fn send_command(&self, domain: &str, name: &str, value: i32) -> ClientResult<()> {
        self.live()?.control(SimControl::Operate(
            format!("{}:{}", domain, name),
            ControlValue::Command(value),
        ))
    }

    async fn send_real_set_point(&self, domain: &str, name: &str, value: f32) -> ClientResult<()> {
        self.live()?.control(SimControl::Operate(
            format!("{}:{}", domain, name),
            ControlValue::SetPointReal(value),
        ))
    }

    async fn send_discrete_set_point(
        &self,
        domain: &str,
        name: &str,
        value: i32,
    ) -> ClientResult<()> {
        self.live()?.control(SimControl::Operate(
            format!("{}:{}", domain, name),
            ControlValue::SetPointDiscrete(value),
        ))
    }

    async fn select_device(&self, domain: &str, name: &str) -> ClientResult<()> {
        self.live()?
            .control(SimControl::Select(format!("{}:{}", domain, name)))
    }

    async fn create_data_set(
        &self,
        domain: &str,
        name: &str,
        entries: &[String],
    ) -> ClientResult<()> {
        let server = self.live()?;
        let mut data_sets = server.data_sets.lock();
        let key = format!("{}:{}", domain, name);
        if data_sets.contains_key(&key) {
            return Err(ClientError::ObjectExists);
        }
        data_sets.insert(key, entries.to_vec());
        Ok(())
    }

    async fn get_data_set(&self, domain: &str, name: &str) -> ClientResult<DataSetHandle> {
        if self.live()?.has_data_set(domain, name) {
            Ok(DataSetHandle {
                domain: domain.to_string(),
                name: name.to_string(),
            })
        } else {
            Err(ClientError::ObjectNotFound)
        }
    }

    async fn next_transfer_set(&self, domain: &str) -> ClientResult<TransferSetHandle> {
        let server = self.live()?;
        let n = server.transfer_set_counter.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(TransferSetHandle {
            domain: domain.to_string(),
            name: format!("DSTrans{}", n),
        })
    }

    async fn write_transfer_set(
        &self,
        transfer_set: &TransferSetHandle,
        params: &TransferSetParams,
    ) -> ClientResult<()> {
        let server = self.live()?;
        if !server.has_data_set(&params.data_set.domain, &params.data_set.name) {
            return Err(ClientError::ObjectNotFound);
        }
        let handler = self.session.lock().handler.clone();
        server.transfer_sets.lock().insert(
            transfer_set.to_string(),
            ArmedTransferSet {
                owner: self.id,
                data_set: format!("{}:{}", params.data_set.domain, params.data_set.name),
                params: params.clone(),
                handler: handler.filter(|_| params.enabled),
            },
        );
        Ok(())
    }

    async fn release_transfer_set(&self, transfer_set: &TransferSetHandle) {
        if let Some(server) = &self.server {
            server.transfer_sets.lock().remove(&transfer_set.to_string());
        }
    }

    fn set_report_handler(&self, handler: Arc<dyn ReportHandler>) {
        self.session.lock().handler = Some(handler);
    }
}
