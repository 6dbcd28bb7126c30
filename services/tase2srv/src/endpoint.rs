//! Protocol library boundary
//!
//! The TASE.2 association (MMS, OSI stack, TLS handshake) belongs to an
//! external protocol library. The bridge reaches it only through the
//! [`Endpoint`] trait, one instance per connection attempt, created by an
//! [`EndpointFactory`]. Reports flow back through a [`ReportHandler`].

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::osi::OsiParameters;
use crate::error::Result;
use crate::tls::TlsMaterial;

/// Association state as reported by the protocol library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Connecting,
    Connected,
}

/// Protocol error code returned by endpoint and connection operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("timeout")]
    Timeout,
    #[error("object does not exist")]
    ObjectNotFound,
    #[error("object already exists")]
    ObjectExists,
    #[error("access denied")]
    AccessDenied,
    #[error("rejected by peer")]
    Rejected,
    #[error("{0}")]
    Failed(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Validity bits of the TASE.2 data flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Held,
    Suspect,
    Invalid,
}

impl Validity {
    pub fn as_str(self) -> &'static str {
        match self {
            Validity::Valid => "valid",
            Validity::Held => "held",
            Validity::Suspect => "suspect",
            Validity::Invalid => "invalid",
        }
    }
}

/// Current source bits of the TASE.2 data flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentSource {
    Telemetered,
    Calculated,
    Entered,
    Estimated,
}

impl CurrentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CurrentSource::Telemetered => "telemetered",
            CurrentSource::Calculated => "calculated",
            CurrentSource::Entered => "entered",
            CurrentSource::Estimated => "estimated",
        }
    }
}

/// Quality flags byte attached to Q-variant point values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFlags(u8);

impl DataFlags {
    pub const SOURCE_CALCULATED: u8 = 0x04;
    pub const SOURCE_ENTERED: u8 = 0x08;
    pub const SOURCE_ESTIMATED: u8 = 0x0c;
    pub const VALIDITY_HELD: u8 = 0x10;
    pub const VALIDITY_SUSPECT: u8 = 0x20;
    pub const VALIDITY_NOT_VALID: u8 = 0x30;
    pub const OFF_NORMAL: u8 = 0x40;
    pub const TIMESTAMP_QUALITY: u8 = 0x80;

    const SOURCE_MASK: u8 = 0x0c;
    const VALIDITY_MASK: u8 = 0x30;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn validity(self) -> Validity {
        match self.0 & Self::VALIDITY_MASK {
            0 => Validity::Valid,
            Self::VALIDITY_HELD => Validity::Held,
            Self::VALIDITY_SUSPECT => Validity::Suspect,
            _ => Validity::Invalid,
        }
    }

    pub fn current_source(self) -> CurrentSource {
        match self.0 & Self::SOURCE_MASK {
            0 => CurrentSource::Telemetered,
            Self::SOURCE_CALCULATED => CurrentSource::Calculated,
            Self::SOURCE_ENTERED => CurrentSource::Entered,
            _ => CurrentSource::Estimated,
        }
    }

    pub fn is_normal(self) -> bool {
        self.0 & Self::OFF_NORMAL == 0
    }
}

/// Raw value carried by a point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValueKind {
    Real(f32),
    State(u8),
    Discrete(i32),
    StateSupplemental(u8),
}

/// Point value as delivered by a read or a report
#[derive(Debug, Clone, PartialEq)]
pub struct PointValue {
    pub kind: PointValueKind,
    pub flags: DataFlags,
    /// Peer timestamp in milliseconds since the epoch, if the type carries one
    pub timestamp_ms: Option<i64>,
}

impl PointValue {
    fn of(kind: PointValueKind) -> Self {
        Self {
            kind,
            flags: DataFlags::default(),
            timestamp_ms: None,
        }
    }

    pub fn real(value: f32) -> Self {
        Self::of(PointValueKind::Real(value))
    }

    pub fn state(value: u8) -> Self {
        Self::of(PointValueKind::State(value))
    }

    pub fn discrete(value: i32) -> Self {
        Self::of(PointValueKind::Discrete(value))
    }

    pub fn state_supplemental(value: u8) -> Self {
        Self::of(PointValueKind::StateSupplemental(value))
    }

    pub fn with_flags(mut self, flags: DataFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn as_i64(&self) -> i64 {
        match self.kind {
            PointValueKind::Real(v) => v as i64,
            PointValueKind::State(v) | PointValueKind::StateSupplemental(v) => i64::from(v),
            PointValueKind::Discrete(v) => i64::from(v),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self.kind {
            PointValueKind::Real(v) => f64::from(v),
            PointValueKind::State(v) | PointValueKind::StateSupplemental(v) => f64::from(v),
            PointValueKind::Discrete(v) => f64::from(v),
        }
    }
}

/// Transfer set trigger conditions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DsConditions(u8);

impl DsConditions {
    pub const NONE: DsConditions = DsConditions(0);
    pub const INTERVAL: DsConditions = DsConditions(0x01);
    pub const INTEGRITY: DsConditions = DsConditions(0x02);
    pub const CHANGE: DsConditions = DsConditions(0x04);
    pub const OPERATOR_REQUEST: DsConditions = DsConditions(0x08);
    pub const EXTERNAL_EVENT: DsConditions = DsConditions(0x10);

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "interval" => Some(Self::INTERVAL),
            "integrity" => Some(Self::INTEGRITY),
            "change" => Some(Self::CHANGE),
            "operator_request" => Some(Self::OPERATOR_REQUEST),
            "external_event" => Some(Self::EXTERNAL_EVENT),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: DsConditions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DsConditions {
    type Output = DsConditions;

    fn bitor(self, rhs: Self) -> Self {
        DsConditions(self.0 | rhs.0)
    }
}

/// Dataset known to the peer, bound to a transfer set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataSetHandle {
    pub domain: String,
    pub name: String,
}

/// Transfer set reserved on the peer for this association
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferSetHandle {
    pub domain: String,
    pub name: String,
}

impl fmt::Display for TransferSetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.domain, self.name)
    }
}

/// Field values written to a transfer set in one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSetParams {
    pub data_set: DataSetHandle,
    pub start_time: u32,
    pub interval: u32,
    pub tle: u32,
    pub buffer_time: u32,
    pub integrity_check: u32,
    pub conditions: DsConditions,
    pub critical: bool,
    pub rbe: bool,
    pub all_changes_reported: bool,
    pub enabled: bool,
}

/// Everything the protocol library needs to build a session object
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub address: String,
    pub port: u16,
    pub tls: Option<Arc<TlsMaterial>>,
    pub osi: Option<OsiParameters>,
}

/// Receiver of report callbacks installed on an endpoint
pub trait ReportHandler: Send + Sync {
    /// Report started (`finished == false`) or finished for one transfer set.
    fn on_report_lifecycle(&self, transfer_set: &str, finished: bool, sequence: u32);

    /// One point value contained in a report.
    fn on_point_value(&self, domain: &str, name: &str, value: PointValue);
}

/// One TASE.2 client association
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn state(&self) -> EndpointState;

    /// Start connecting; completion is observed through [`Endpoint::state`].
    async fn connect(&self) -> ClientResult<()>;

    async fn disconnect(&self);

    async fn read_point_value(&self, domain: &str, name: &str) -> ClientResult<PointValue>;

    async fn send_command(&self, domain: &str, name: &str, value: i32) -> ClientResult<()>;

    async fn send_real_set_point(&self, domain: &str, name: &str, value: f32) -> ClientResult<()>;

    async fn send_discrete_set_point(&self, domain: &str, name: &str, value: i32)
        -> ClientResult<()>;

    async fn select_device(&self, domain: &str, name: &str) -> ClientResult<()>;

    /// `members` are `domain:name` point references.
    async fn create_data_set(&self, domain: &str, name: &str, members: &[String])
        -> ClientResult<()>;

    async fn get_data_set(&self, domain: &str, name: &str) -> ClientResult<DataSetHandle>;

    /// Reserve the next free transfer set of `domain` for this association.
    async fn next_transfer_set(&self, domain: &str) -> ClientResult<TransferSetHandle>;

    async fn write_transfer_set(
        &self,
        transfer_set: &TransferSetHandle,
        params: &TransferSetParams,
    ) -> ClientResult<()>;

    async fn release_transfer_set(&self, transfer_set: &TransferSetHandle);

    fn set_report_handler(&self, handler: Arc<dyn ReportHandler>);
}

/// Builds session objects; failure here is fatal for the requesting connection.
pub trait EndpointFactory: Send + Sync {
    fn create(&self, settings: EndpointSettings) -> Result<Box<dyn Endpoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_flags_decoding() {
        let flags = DataFlags::default();
        assert_eq!(flags.validity(), Validity::Valid);
        assert_eq!(flags.current_source(), CurrentSource::Telemetered);
        assert!(flags.is_normal());

        let flags = DataFlags::new(
            DataFlags::VALIDITY_SUSPECT | DataFlags::SOURCE_ENTERED | DataFlags::OFF_NORMAL,
        );
        assert_eq!(flags.validity().as_str(), "suspect");
        assert_eq!(flags.current_source().as_str(), "entered");
        assert!(!flags.is_normal());

        let flags = DataFlags::new(DataFlags::VALIDITY_NOT_VALID | DataFlags::SOURCE_ESTIMATED);
        assert_eq!(flags.validity(), Validity::Invalid);
        assert_eq!(flags.current_source(), CurrentSource::Estimated);

        assert_eq!(DataFlags::new(DataFlags::VALIDITY_HELD).validity(), Validity::Held);
        assert_eq!(
            DataFlags::new(DataFlags::SOURCE_CALCULATED).current_source(),
            CurrentSource::Calculated
        );
    }

    #[test]
    fn test_ds_conditions() {
        let cond = DsConditions::from_name("interval").unwrap() | DsConditions::CHANGE;
        assert!(cond.contains(DsConditions::INTERVAL));
        assert!(cond.contains(DsConditions::CHANGE));
        assert!(!cond.contains(DsConditions::INTEGRITY));
        assert_eq!(cond.bits(), 0x05);
        assert!(DsConditions::from_name("on_change").is_none());
        assert!(DsConditions::NONE.is_empty());
    }

    #[test]
    fn test_point_value_conversions() {
        assert_eq!(PointValue::real(1.75).as_f64(), 1.75);
        assert_eq!(PointValue::real(-2.5).as_i64(), -2);
        assert_eq!(PointValue::discrete(42).as_f64(), 42.0);
        assert_eq!(PointValue::state(2).as_i64(), 2);
        let v = PointValue::state_supplemental(3).with_timestamp(1_700_000_000_000);
        assert_eq!(v.timestamp_ms, Some(1_700_000_000_000));
    }
}
