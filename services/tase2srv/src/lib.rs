//! TASE.2/ICCP client data-acquisition bridge
//!
//! Maintains redundant connections to a remote ICCP server, keeps exactly
//! one of them active, acquires point values through polling and dataset
//! transfer set reports, and forwards them as labeled readings to an
//! ingestion sink. Operator commands travel the opposite way.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  ClientConfig   │───►│   Tase2Client   │───►│  Connection[n]  │
//! │  (JSON import)  │    │  (supervisor)   │    │ (state machine) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │                       │
//!                                 ▼                       ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │   Dispatcher    │◄───│    Endpoint     │
//!                        │ (value mapping) │    │ (protocol lib)  │
//!                        └─────────────────┘    └─────────────────┘
//!                                 │
//!                                 ▼
//!                           IngestSink
//! ```
//!
//! The protocol library is reached only through the [`endpoint::Endpoint`]
//! and [`endpoint::EndpointFactory`] traits; [`simulator`] provides an
//! in-process implementation for tests and demos.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod plugin;
pub mod reading;
pub mod simulator;
pub mod tls;

pub use client::{ConnectionStatus, Tase2Client};
pub use config::{ClientConfig, ExchangeDefinition, PointType};
pub use connection::{Connection, ConnectionState};
pub use dispatch::{Dispatcher, IngestSink};
pub use endpoint::{ClientError, Endpoint, EndpointFactory, EndpointState, PointValue};
pub use error::{Result, Tase2Error};
pub use plugin::Tase2Plugin;
pub use reading::{Datapoint, DatapointValue, Reading, ValueSource};
