//! Redundancy supervisor
//!
//! Owns one [`Connection`] per configured redundancy group and keeps at
//! most one of them active. Configured order is priority order: every scan
//! starts from the first group, and while a backup is active the
//! higher-priority groups are probed again every `failback_interval`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ControlValue};
use crate::dispatch::{now_ms, Dispatcher, IngestSink};
use crate::endpoint::{ClientError, ClientResult, EndpointFactory, PointValue};
use crate::reading::ValueSource;

/// Pause between two supervisor passes
pub const SCAN_INTERVAL: Duration = Duration::from_millis(100);
/// Poll period while waiting for a candidate to connect
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Started,
}

pub struct Tase2Client {
    config: Arc<ClientConfig>,
    dispatcher: Arc<Dispatcher>,
    factory: Arc<dyn EndpointFactory>,
    connections: RwLock<Vec<Arc<Connection>>>,
    active: RwLock<Option<Arc<Connection>>>,
    supervisor: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl Tase2Client {
    pub fn new(
        config: Arc<ClientConfig>,
        factory: Arc<dyn EndpointFactory>,
        sink: Arc<dyn IngestSink>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config), sink));
        Self {
            config,
            dispatcher,
            factory,
            connections: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if self.supervisor.lock().is_some() {
            ConnectionStatus::Started
        } else {
            ConnectionStatus::NotConnected
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Snapshot of the active connection
    pub fn active_connection(&self) -> Option<Arc<Connection>> {
        self.active.read().clone()
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active.read().as_ref().map(|c| c.id())
    }

    /// Create the connections and spawn the supervisor.
    pub fn start(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            warn!("TASE.2 client already started");
            return;
        }

        if self.config.connections.is_empty() {
            warn!("No redundancy group configured, nothing to connect to");
        }

        let connections: Vec<Arc<Connection>> = self
            .config
            .connections
            .iter()
            .enumerate()
            .map(|(id, group)| {
                Arc::new(Connection::new(
                    id,
                    group.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.factory),
                    Arc::clone(&self.dispatcher),
                ))
            })
            .collect();
        for connection in &connections {
            connection.start();
        }
        *self.connections.write() = connections;

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).supervise(token.clone()));
        *supervisor = Some((handle, token));
        info!(
            "TASE.2 client started with {} redundancy groups",
            self.config.connections.len()
        );
    }

    /// Stop the supervisor; every connection is stopped and released.
    pub async fn stop(&self) {
        let task = self.supervisor.lock().take();
        let Some((handle, token)) = task else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            error!("TASE.2 supervisor task failed: {}", e);
        }
        info!("TASE.2 client stopped");
    }

    async fn supervise(self: Arc<Self>, token: CancellationToken) {
        let mut last_failback = Instant::now();

        while !token.is_cancelled() {
            let active = self.active_connection();
            let healthy = active.as_ref().is_some_and(|c| !c.is_disconnected());

            if !healthy {
                if let Some(lost) = active {
                    warn!("{} is no longer connected", lost);
                    self.swap_active(None);
                }
                if let Some(next) = self.scan(&token).await {
                    self.swap_active(Some(next));
                }
                last_failback = Instant::now();
            } else if let Some(current) = active {
                if self.config.failback
                    && current.id() > 0
                    && last_failback.elapsed() >= self.config.failback_interval
                {
                    self.fail_back(&token, &current).await;
                    last_failback = Instant::now();
                }
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(SCAN_INTERVAL) => {},
            }
        }

        self.swap_active(None);
        let connections = std::mem::take(&mut *self.connections.write());
        for connection in &connections {
            connection.stop().await;
        }
        debug!("Supervisor released {} connections", connections.len());
    }

    /// First connection, in priority order, that connects within budget.
    async fn scan(&self, token: &CancellationToken) -> Option<Arc<Connection>> {
        for connection in self.connections() {
            if token.is_cancelled() {
                return None;
            }
            if connection.is_fatal() {
                debug!("{} skipped, fatal error", connection);
                continue;
            }
            connection.mute_reports(false);
            if self.try_connect(&connection, None, token).await {
                return Some(connection);
            }
        }
        None
    }

    /// Probe the higher-priority connections while `current` is active.
    /// Candidates stay muted until they take over, and the probe is
    /// abandoned as soon as `current` drops.
    async fn fail_back(&self, token: &CancellationToken, current: &Arc<Connection>) {
        let preferred: Vec<Arc<Connection>> = self
            .connections()
            .into_iter()
            .take_while(|c| c.id() != current.id())
            .collect();

        for connection in preferred {
            if token.is_cancelled() {
                return;
            }
            if connection.is_fatal() {
                continue;
            }
            debug!("Probing {} for fail-back", connection);
            connection.mute_reports(true);
            if self.try_connect(&connection, Some(current.as_ref()), token).await {
                info!("Failing back from {} to {}", current, connection);
                current.mute_reports(true);
                let previous = self.swap_active(Some(Arc::clone(&connection)));
                connection.mute_reports(false);
                if let Some(previous) = previous {
                    previous.disconnect().await;
                }
                return;
            }
            if current.is_disconnected() {
                warn!("{} lost during fail-back probe", current);
                self.swap_active(None);
                return;
            }
        }
    }

    /// Request a connect and wait up to `backup_timeout` for it.
    /// A candidate that misses the budget is disconnected. The wait ends
    /// early, leaving the candidate connecting, once `watch` drops.
    async fn try_connect(
        &self,
        connection: &Connection,
        watch: Option<&Connection>,
        token: &CancellationToken,
    ) -> bool {
        connection.request_connect();
        let deadline = Instant::now() + self.config.backup_timeout;

        loop {
            if connection.is_connected() {
                return true;
            }
            if connection.is_fatal() {
                return false;
            }
            if watch.is_some_and(Connection::is_disconnected) {
                return false;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(CONNECT_POLL_INTERVAL) => {},
            }
        }

        warn!(
            "{} not connected within {:?}",
            connection, self.config.backup_timeout
        );
        connection.disconnect().await;
        false
    }

    /// Replace the active connection. Returns the previous one.
    fn swap_active(&self, next: Option<Arc<Connection>>) -> Option<Arc<Connection>> {
        let mut active = self.active.write();
        if let Some(previous) = active.as_ref() {
            previous.set_active(false);
        }
        if let Some(connection) = &next {
            connection.set_active(true);
            info!("{} is now active", connection);
        }
        std::mem::replace(&mut *active, next)
    }

    /// One read per polled point through the active connection.
    pub async fn handle_all_values(&self) -> usize {
        match self.active_connection() {
            Some(connection) => self.dispatcher.poll(&connection).await,
            None => {
                debug!("No active connection, poll skipped");
                0
            },
        }
    }

    pub async fn read_value(&self, domain: &str, name: &str) -> ClientResult<PointValue> {
        let connection = self.active_connection().ok_or(ClientError::NotConnected)?;
        connection.read_value(domain, name).await
    }

    pub async fn send_command(
        &self,
        domain: &str,
        name: &str,
        value: i32,
        select: bool,
        timestamp: i64,
    ) -> bool {
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
    ) -> bool {
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
    ) -> bool {
        self.operate(domain, name, ControlValue::SetPointDiscrete(value), select, timestamp)
            .await
    }

    /// Forward to the active connection; on success the sent value is
    /// echoed to the sink as an acknowledgement.
    async fn operate(
        &self,
        domain: &str,
        name: &str,
        value: ControlValue,
        select: bool,
        timestamp: i64,
    ) -> bool {
        let reference = format!("{}:{}", domain, name);
        if self.config.definition_by_ref(&reference).is_none() {
            warn!("Unknown control point {}, request rejected", reference);
            return false;
        }

        let Some(connection) = self.active_connection() else {
            warn!("No active connection, {} not sent", reference);
            return false;
        };

        let result = match value {
            ControlValue::Command(v) => {
                connection
                    .send_command(domain, name, v, select, timestamp)
                    .await
            },
            ControlValue::SetPointReal(v) => {
                connection
                    .send_set_point_real(domain, name, v, select, timestamp)
                    .await
            },
            ControlValue::SetPointDiscrete(v) => {
                connection
                    .send_set_point_discrete(domain, name, v, select, timestamp)
                    .await
            },
        };

        match result {
            Ok(()) => {
                self.dispatcher.handle_value(
                    &reference,
                    value.as_point_value(),
                    now_ms(),
                    ValueSource::Acknowledgement,
                );
                true
            },
            Err(e) => {
                warn!("{} {} failed: {}", connection, reference, e);
                false
            },
        }
    }
}
