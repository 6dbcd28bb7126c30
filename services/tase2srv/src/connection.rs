//! Connection to one redundancy group
//!
//! Each connection runs its own tick-driven state machine:
//!
//! ```text
//!            connect requested          endpoint connected
//!   ┌──────┐ ─────────────────► ┌────────────┐ ──────────────► ┌───────────┐
//!   │ IDLE │                    │ CONNECTING │                 │ CONNECTED │
//!   └──────┘ ◄───────────────── └────────────┘                 └───────────┘
//!     ▲  │        timeout             │ connect refused              │
//!     │  │ session setup failed       ▼                              │ lost
//!     │  ▼               ┌───────────────────┐                       │
//!     │ FATAL_ERROR      │ WAIT_FOR_RECONNECT│                       │
//!     │                  └───────────────────┘                       │
//!     └─────────────── cooldown / connection lost ◄──────────────────┘
//! ```
//!
//! Every way out of CONNECTING or CONNECTED releases the whole session
//! (transfer sets, datasets, endpoint, TLS material) before a new attempt.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, RedundancyGroup};
use crate::dispatch::Dispatcher;
use crate::endpoint::{
    ClientError, ClientResult, DataSetHandle, Endpoint, EndpointFactory, EndpointSettings,
    EndpointState, PointValue, ReportHandler, TransferSetHandle,
};
use crate::error::Result;
use crate::tls::TlsMaterial;

/// State machine tick period
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    WaitForReconnect,
    Closed,
    FatalError,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::WaitForReconnect => "WAIT_FOR_RECONNECT",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::FatalError => "FATAL_ERROR",
        };
        f.write_str(name)
    }
}

/// Select/operate sequencing of one controllable point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    WaitForSelect,
    Selected,
    WaitForActCon,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlValue {
    Command(i32),
    SetPointReal(f32),
    SetPointDiscrete(i32),
}

impl ControlValue {
    /// Value echoed through the dispatcher after a successful operation
    pub fn as_point_value(self) -> PointValue {
        match self {
            ControlValue::Command(v) | ControlValue::SetPointDiscrete(v) => PointValue::discrete(v),
            ControlValue::SetPointReal(v) => PointValue::real(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlObject {
    pub label: String,
    pub state: OperationState,
    pub last_value: Option<ControlValue>,
}

struct Status {
    state: ConnectionState,
    connect_requested: bool,
    deadline: Option<Instant>,
    next_poll: Option<Instant>,
}

/// Resources of one association attempt
struct Session {
    endpoint: Box<dyn Endpoint>,
    // kept alive for the lifetime of the association
    _tls: Option<Arc<TlsMaterial>>,
    data_sets: Vec<DataSetHandle>,
    transfer_sets: Vec<TransferSetHandle>,
}

/// Report callbacks of one connection, dropped while muted
struct ReportGate {
    muted: Arc<AtomicBool>,
    dispatcher: Arc<Dispatcher>,
}

impl ReportHandler for ReportGate {
    fn on_report_lifecycle(&self, transfer_set: &str, finished: bool, sequence: u32) {
        if !self.muted.load(Ordering::Acquire) {
            self.dispatcher
                .on_report_lifecycle(transfer_set, finished, sequence);
        }
    }

    fn on_point_value(&self, domain: &str, name: &str, value: PointValue) {
        if self.muted.load(Ordering::Acquire) {
            debug!("Report value {}:{} dropped, connection muted", domain, name);
            return;
        }
        self.dispatcher.on_point_value(domain, name, value);
    }
}

pub struct Connection {
    id: usize,
    group: RedundancyGroup,
    config: Arc<ClientConfig>,
    factory: Arc<dyn EndpointFactory>,
    dispatcher: Arc<Dispatcher>,
    status: Mutex<Status>,
    session: tokio::sync::Mutex<Option<Session>>,
    controls: Mutex<HashMap<String, ControlObject>>,
    active: AtomicBool,
    reports_muted: Arc<AtomicBool>,
    task: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn{} {}:{}", self.id, self.group.address, self.group.port)
    }
}

impl Connection {
    pub fn new(
        id: usize,
        group: RedundancyGroup,
        config: Arc<ClientConfig>,
        factory: Arc<dyn EndpointFactory>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            id,
            group,
            config,
            factory,
            dispatcher,
            status: Mutex::new(Status {
                state: ConnectionState::Idle,
                connect_requested: false,
                deadline: None,
                next_poll: None,
            }),
            session: tokio::sync::Mutex::new(None),
            controls: Mutex::new(HashMap::new()),
            active: AtomicBool::new(false),
            reports_muted: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn group(&self) -> &RedundancyGroup {
        &self.group
    }

    pub fn port(&self) -> u16 {
        self.group.port
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Neither connecting nor connected
    pub fn is_disconnected(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn is_fatal(&self) -> bool {
        self.state() == ConnectionState::FatalError
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn reports_muted(&self) -> bool {
        self.reports_muted.load(Ordering::Acquire)
    }

    /// Drop incoming report values while another connection delivers them.
    pub(crate) fn mute_reports(&self, muted: bool) {
        self.reports_muted.store(muted, Ordering::Release);
    }

    /// Ask the state machine to (re)establish the association.
    pub fn request_connect(&self) {
        let mut status = self.status.lock();
        if matches!(
            status.state,
            ConnectionState::FatalError | ConnectionState::Closed
        ) {
            return;
        }
        status.connect_requested = true;
    }

    /// Spawn the state machine loop. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *task = Some((handle, token));
        debug!("{} state machine started", self);
    }

    /// Stop the loop and wait until its session is released.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((handle, token)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                error!("{} state machine task failed: {}", self, e);
            }
        }
    }

    /// Drop the association and clear the pending connect request.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;

        let mut status = self.status.lock();
        status.connect_requested = false;
        status.deadline = None;
        if matches!(
            status.state,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::WaitForReconnect
        ) {
            status.state = ConnectionState::Idle;
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.process_tick().await,
            }
        }

        let mut session = self.session.lock().await;
        self.teardown(&mut session).await;
        drop(session);

        let mut status = self.status.lock();
        status.state = ConnectionState::Closed;
        status.connect_requested = false;
        info!("{} closed", self);
    }

    async fn process_tick(&self) {
        let (state, requested) = {
            let status = self.status.lock();
            (status.state, status.connect_requested)
        };

        match state {
            ConnectionState::Idle if requested => self.open_session().await,
            ConnectionState::Connecting => self.check_connecting().await,
            ConnectionState::Connected => self.check_connected().await,
            ConnectionState::WaitForReconnect => {
                let mut status = self.status.lock();
                let cooled = status.deadline.map_or(true, |d| Instant::now() >= d);
                if cooled || !status.connect_requested {
                    status.state = ConnectionState::Idle;
                    status.deadline = None;
                }
            },
            _ => {},
        }
    }

    fn prepare(&self) -> Result<(Box<dyn Endpoint>, Option<Arc<TlsMaterial>>)> {
        let tls = if self.group.tls {
            let material = TlsMaterial::load(&self.config.tls, &self.config.cert_store())?;
            Some(Arc::new(material))
        } else {
            None
        };

        let endpoint = self.factory.create(EndpointSettings {
            address: self.group.address.clone(),
            port: self.group.port,
            tls: tls.clone(),
            osi: self.group.osi.clone(),
        })?;

        Ok((endpoint, tls))
    }

    async fn open_session(&self) {
        let mut session = self.session.lock().await;
        let requested = self.status.lock().connect_requested;
        if !requested {
            return;
        }
        self.teardown(&mut session).await;

        debug!("{} preparing connection", self);
        let (endpoint, tls) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("{} session setup failed, giving up: {}", self, e);
                let mut status = self.status.lock();
                status.state = ConnectionState::FatalError;
                status.connect_requested = false;
                return;
            },
        };

        match endpoint.connect().await {
            Ok(()) => {
                *session = Some(Session {
                    endpoint,
                    _tls: tls,
                    data_sets: Vec::new(),
                    transfer_sets: Vec::new(),
                });
                let mut status = self.status.lock();
                status.state = ConnectionState::Connecting;
                status.deadline = Some(Instant::now() + self.config.connect_timeout);
                info!("{} connecting", self);
            },
            Err(e) => {
                warn!("{} connect failed: {}", self, e);
                endpoint.disconnect().await;
                let mut status = self.status.lock();
                status.state = ConnectionState::WaitForReconnect;
                status.deadline = Some(Instant::now() + self.config.reconnect_delay);
            },
        }
    }

    async fn check_connecting(&self) {
        let mut session = self.session.lock().await;

        let endpoint_state = match session.as_ref() {
            Some(s) => s.endpoint.state(),
            None => EndpointState::Idle,
        };

        if endpoint_state == EndpointState::Connected {
            if let Some(s) = session.as_mut() {
                self.post_connect_setup(s).await;
            }
            let mut status = self.status.lock();
            status.state = ConnectionState::Connected;
            status.deadline = None;
            status.next_poll = Some(Instant::now());
            info!("{} connected", self);
            return;
        }

        let expired = self
            .status
            .lock()
            .deadline
            .map_or(true, |d| Instant::now() >= d);
        if expired {
            warn!("{} connect timeout", self);
            self.teardown(&mut session).await;
            let mut status = self.status.lock();
            status.state = ConnectionState::Idle;
            status.connect_requested = false;
            status.deadline = None;
        }
    }

    /// Create dynamic datasets, arm transfer sets, install report callbacks.
    async fn post_connect_setup(&self, session: &mut Session) {
        session.endpoint.set_report_handler(Arc::new(ReportGate {
            muted: Arc::clone(&self.reports_muted),
            dispatcher: Arc::clone(&self.dispatcher),
        }));

        for ds in self.config.datasets.values().filter(|ds| ds.dynamic) {
            let members: Vec<String> = ds.entry_refs().collect();
            match session
                .endpoint
                .create_data_set(&ds.domain, &ds.name, &members)
                .await
            {
                Ok(()) => debug!("{} dataset {}:{} created", self, ds.domain, ds.name),
                Err(ClientError::ObjectExists) => {
                    debug!("{} dataset {}:{} already exists", self, ds.domain, ds.name)
                },
                Err(e) => warn!(
                    "{} failed to create dataset {}:{}: {}",
                    self, ds.domain, ds.name, e
                ),
            }
        }

        for dsts in self.config.transfer_sets.values() {
            let handle = match session.endpoint.next_transfer_set(&dsts.domain).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("{} no transfer set available for {}: {}", self, dsts.name, e);
                    continue;
                },
            };

            let data_set = match session
                .endpoint
                .get_data_set(&dsts.dataset_domain, &dsts.dataset_ref)
                .await
            {
                Ok(ds) => ds,
                Err(e) => {
                    warn!(
                        "{} dataset {} for {} unavailable: {}",
                        self, dsts.dataset_ref, dsts.name, e
                    );
                    session.endpoint.release_transfer_set(&handle).await;
                    continue;
                },
            };

            let params = dsts.params(data_set.clone());
            match session.endpoint.write_transfer_set(&handle, &params).await {
                Ok(()) => {
                    info!(
                        "{} transfer set {} armed as {} on {}:{}",
                        self, dsts.name, handle, data_set.domain, data_set.name
                    );
                    session.transfer_sets.push(handle);
                    session.data_sets.push(data_set);
                },
                Err(e) => {
                    warn!("{} failed to configure {}: {}", self, dsts.name, e);
                    session.endpoint.release_transfer_set(&handle).await;
                },
            }
        }
    }

    async fn check_connected(&self) {
        let lost = {
            let session = self.session.lock().await;
            session
                .as_ref()
                .map_or(true, |s| s.endpoint.state() != EndpointState::Connected)
        };

        if lost {
            warn!("{} connection lost", self);
            let mut session = self.session.lock().await;
            self.teardown(&mut session).await;
            let mut status = self.status.lock();
            if status.state == ConnectionState::Connected {
                status.state = ConnectionState::Idle;
                status.connect_requested = false;
            }
            return;
        }

        self.execute_periodic_tasks().await;
    }

    async fn execute_periodic_tasks(&self) {
        let interval = self.config.polling_interval;
        if interval.is_zero() {
            return;
        }

        let due = {
            let mut status = self.status.lock();
            let now = Instant::now();
            match status.next_poll {
                Some(next) if now < next => false,
                _ => {
                    status.next_poll = Some(now + interval);
                    true
                },
            }
        };

        if due && self.is_active() {
            self.dispatcher.poll(self).await;
        }
    }

    /// Release every session resource; safe to call with no session.
    async fn teardown(&self, session: &mut Option<Session>) {
        if let Some(s) = session.take() {
            for ts in &s.transfer_sets {
                s.endpoint.release_transfer_set(ts).await;
            }
            s.endpoint.disconnect().await;
            debug!(
                "{} session released ({} transfer sets, {} datasets)",
                self,
                s.transfer_sets.len(),
                s.data_sets.len()
            );
        }
        self.controls.lock().clear();
    }

    fn ready<'a>(&self, session: &'a Option<Session>) -> ClientResult<&'a Session> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        session.as_ref().ok_or(ClientError::NotConnected)
    }

    pub async fn read_value(&self, domain: &str, name: &str) -> ClientResult<PointValue> {
        let guard = self.session.lock().await;
        let session = self.ready(&guard)?;
        session.endpoint.read_point_value(domain, name).await
    }

    pub async fn send_command(
        &self,
        domain: &str,
        name: &str,
        value: i32,
        select: bool,
        timestamp: i64,
    ) -> ClientResult<()> {
        self.operate(domain, name, ControlValue::Command(value), select, timestamp)
            .await
    }

    pub async fn send_set_point_real(
        &self,
        domain: &str,
        name: &str,
        value: f32,
        select: bool,
        timestamp: i64,
    ) -> ClientResult<()> {
        self.operate(domain, name, ControlValue::SetPointReal(value), select, timestamp)
            .await
    }

    pub async fn send_set_point_discrete(
        &self,
        domain: &str,
        name: &str,
        value: i32,
        select: bool,
        timestamp: i64,
    ) -> ClientResult<()> {
        self.operate(domain, name, ControlValue::SetPointDiscrete(value), select, timestamp)
            .await
    }

    /// Select only when `select` is set, otherwise operate directly.
    async fn operate(
        &self,
        domain: &str,
        name: &str,
        value: ControlValue,
        select: bool,
        timestamp: i64,
    ) -> ClientResult<()> {
        let reference = format!("{}:{}", domain, name);
        let guard = self.session.lock().await;
        let session = self.ready(&guard)?;

        debug!(
            "{} {} {} {:?} (ts {})",
            self,
            if select { "select" } else { "operate" },
            reference,
            value,
            timestamp
        );

        if select {
            self.update_control(&reference, OperationState::WaitForSelect, None);
            let result = session.endpoint.select_device(domain, name).await;
            let next = if result.is_ok() {
                OperationState::Selected
            } else {
                OperationState::Idle
            };
            self.update_control(&reference, next, None);
            return result;
        }

        self.update_control(&reference, OperationState::WaitForActCon, None);
        let result = match value {
            ControlValue::Command(v) => session.endpoint.send_command(domain, name, v).await,
            ControlValue::SetPointReal(v) => {
                session.endpoint.send_real_set_point(domain, name, v).await
            },
            ControlValue::SetPointDiscrete(v) => {
                session.endpoint.send_discrete_set_point(domain, name, v).await
            },
        };
        let written = result.as_ref().ok().map(|_| value);
        self.update_control(&reference, OperationState::Idle, written);
        result
    }

    fn update_control(&self, reference: &str, state: OperationState, value: Option<ControlValue>) {
        let mut controls = self.controls.lock();
        let control = controls
            .entry(reference.to_string())
            .or_insert_with(|| ControlObject {
                label: self
                    .config
                    .definition_by_ref(reference)
                    .map(|d| d.label.clone())
                    .unwrap_or_default(),
                state: OperationState::Idle,
                last_value: None,
            });
        control.state = state;
        if value.is_some() {
            control.last_value = value;
        }
    }

    /// Control object of `domain:name`, if a command targeted it since connect.
    pub fn control(&self, reference: &str) -> Option<ControlObject> {
        self.controls.lock().get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ValueSource;
    use crate::simulator::{RecordingSink, SimControl, SimNetwork};

    const PORT: u16 = 20202;

    fn protocol(tls: bool) -> String {
        format!(
            r#"{{
            "protocol_stack": {{
                "name": "tase2client",
                "transport_layer": {{
                    "connections": [{{ "ip_addr": "127.0.0.1", "port": {}, "tls": {} }}],
                    "connectTimeout": 200,
                    "reconnectDelay": 100
                }},
                "application_layer": {{
                    "datasets": [
                        {{ "dataset_ref": "DS1", "domain": "icc1", "entries": ["p1"], "dynamic": true }}
                    ],
                    "dataset_transfer_sets": [
                        {{ "name": "DSTS1", "dataset_ref": "DS1", "dsConditions": ["change"], "rbe": true }}
                    ]
                }}
            }}
        }}"#,
            PORT, tls
        )
    }

    const EXCHANGED: &str = r#"{
        "exchanged_data": {
            "datapoints": [
                { "label": "TS1", "protocols": [{ "name": "tase2", "ref": "icc1:p1", "typeid": "Real" }] },
                { "label": "TC1", "protocols": [{ "name": "tase2", "ref": "icc1:cmd", "typeid": "Command" }] }
            ]
        }
    }"#;

    fn connection(
        network: &SimNetwork,
        sink: &Arc<RecordingSink>,
        tls: bool,
    ) -> Arc<Connection> {
        connection_with(network, sink, &protocol(tls))
    }

    fn connection_with(
        network: &SimNetwork,
        sink: &Arc<RecordingSink>,
        protocol: &str,
    ) -> Arc<Connection> {
        let config = Arc::new(ClientConfig::from_json(protocol, EXCHANGED, "").unwrap());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(sink) as Arc<dyn crate::dispatch::IngestSink>,
        ));
        Arc::new(Connection::new(
            0,
            config.connections[0].clone(),
            config,
            Arc::new(network.clone()),
            dispatcher,
        ))
    }

    async fn wait_for(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_connect_arms_transfer_sets_and_reports() {
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        server.start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        assert_eq!(conn.to_string(), format!("Conn0 127.0.0.1:{}", PORT));
        conn.start();
        assert_eq!(conn.state(), ConnectionState::Idle);
        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);

        assert!(server.has_data_set("icc1", "DS1"));
        assert_eq!(server.armed_transfer_sets(), 1);

        assert_eq!(server.set_point("icc1:p1", PointValue::real(3.5)), 1);
        let readings = sink.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].source, ValueSource::Report);
        assert_eq!(readings[0].field("do_value").and_then(|d| d.as_f64()), Some(3.5));

        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(server.armed_transfer_sets(), 0);
        assert_eq!(server.association_count(), 0);
    }

    #[tokio::test]
    async fn test_transfer_set_parameters_reach_peer() {
        let protocol = format!(
            r#"{{
            "protocol_stack": {{
                "transport_layer": {{
                    "connections": [{{ "ip_addr": "127.0.0.1", "port": {} }}]
                }},
                "application_layer": {{
                    "datasets": [
                        {{ "dataset_ref": "DS1", "domain": "icc1", "entries": ["p1"], "dynamic": true }}
                    ],
                    "dataset_transfer_sets": [
                        {{
                            "name": "DSTS1",
                            "dataset_ref": "DS1",
                            "dsConditions": ["interval", "integrity", "change"],
                            "interval": 10,
                            "tle": 60,
                            "bufTm": 2,
                            "integrityCheck": 300,
                            "critical": true,
                            "rbe": false,
                            "allChangesReported": true,
                            "startTime": 5
                        }}
                    ]
                }}
            }}
        }}"#,
            PORT
        );
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        server.start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection_with(&network, &sink, &protocol);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);

        let armed = server.transfer_set_params();
        assert_eq!(armed.len(), 1);
        let params = &armed[0];
        assert_eq!(
            params.data_set,
            DataSetHandle {
                domain: "icc1".to_string(),
                name: "DS1".to_string(),
            }
        );
        assert_eq!(params.integrity_check, 300);
        assert_eq!(params.interval, 10);
        assert_eq!(params.tle, 60);
        assert_eq!(params.buffer_time, 2);
        assert_eq!(params.start_time, 5);
        assert_eq!(
            params.conditions,
            crate::endpoint::DsConditions::INTERVAL
                | crate::endpoint::DsConditions::INTEGRITY
                | crate::endpoint::DsConditions::CHANGE
        );
        assert!(params.critical);
        assert!(!params.rbe);
        assert!(params.all_changes_reported);
        assert!(params.enabled);

        conn.stop().await;
    }

    #[tokio::test]
    async fn test_muted_connection_drops_reports() {
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        server.start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.mute_reports(true);
        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);
        assert!(conn.reports_muted());

        assert_eq!(server.set_point("icc1:p1", PointValue::real(1.0)), 1);
        assert!(sink.is_empty());

        conn.mute_reports(false);
        assert_eq!(server.set_point("icc1:p1", PointValue::real(2.0)), 1);
        assert_eq!(sink.count_for("TS1"), 1);

        conn.stop().await;
    }

    #[tokio::test]
    async fn test_loss_releases_session_and_clears_request() {
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        server.start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);

        server.stop();
        assert!(wait_for(|| conn.state() == ConnectionState::Idle).await);
        assert!(conn.is_disconnected());

        // no reconnect without a new request
        server.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.state(), ConnectionState::Idle);

        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);
        assert_eq!(network.endpoints_created(), 2);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_refused_connect_waits_before_retry() {
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.state() == ConnectionState::WaitForReconnect).await);

        server.start();
        assert!(wait_for(|| conn.is_connected()).await);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_to_idle() {
        // nothing registered at the address: connect never completes
        let network = SimNetwork::new();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_connecting()).await);
        assert!(wait_for(|| conn.state() == ConnectionState::Idle).await);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_endpoint_creation_failure_is_fatal() {
        let network = SimNetwork::new();
        network.add_server("127.0.0.1", PORT).start();
        network.fail_endpoint_creation(true);
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_fatal()).await);

        network.fail_endpoint_creation(false);
        conn.request_connect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(conn.is_fatal());
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_missing_tls_material_is_fatal() {
        let network = SimNetwork::new();
        network.add_server("127.0.0.1", PORT).start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, true);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_fatal()).await);
        assert_eq!(network.endpoints_created(), 0);
        conn.stop().await;
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let network = SimNetwork::new();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        assert_eq!(
            conn.read_value("icc1", "p1").await,
            Err(ClientError::NotConnected)
        );
        assert_eq!(
            conn.send_command("icc1", "cmd", 1, false, 0).await,
            Err(ClientError::NotConnected)
        );
        assert!(conn.control("icc1:cmd").is_none());
    }

    #[tokio::test]
    async fn test_select_before_operate() {
        let network = SimNetwork::new();
        let server = network.add_server("127.0.0.1", PORT);
        server.start();
        let sink = Arc::new(RecordingSink::new());
        let conn = connection(&network, &sink, false);

        conn.start();
        conn.request_connect();
        assert!(wait_for(|| conn.is_connected()).await);

        conn.send_command("icc1", "cmd", 1, true, 0).await.unwrap();
        let control = conn.control("icc1:cmd").unwrap();
        assert_eq!(control.state, OperationState::Selected);
        assert_eq!(control.last_value, None);
        assert_eq!(server.controls(), vec![SimControl::Select("icc1:cmd".to_string())]);

        conn.send_command("icc1", "cmd", 1, false, 0).await.unwrap();
        let control = conn.control("icc1:cmd").unwrap();
        assert_eq!(control.state, OperationState::Idle);
        assert_eq!(control.last_value, Some(ControlValue::Command(1)));
        assert_eq!(server.controls().len(), 2);

        // connection level commands leave acknowledgement to the caller
        assert!(sink.is_empty());

        conn.disconnect().await;
        assert!(conn.control("icc1:cmd").is_none());
        conn.stop().await;
    }
}
