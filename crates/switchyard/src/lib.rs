//! switchyard - MQTT RPC runtime.
//!
//! Three layers, leaves first:
//!
//! - [`session`]: one transport connection to an MQTT broker. Owns the
//!   dedicated I/O task, the connection state machine, the subscription set
//!   that is re-applied on every reconnect, heartbeats, and statistics.
//! - [`client`]: request/response RPC over a session. Correlates responses
//!   to pending requests by transaction id, enforces timeouts with a
//!   background reaper, and delivers unmatched traffic to a user handler.
//! - [`relay`]: forwards messages between several sessions through a rule
//!   table with conditional filters and topic rewriting.
//!
//! The wire format (envelopes, topics, transaction ids) lives in
//! `yardproto`; configuration in `yardconf`.

pub mod client;
pub mod error;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod tls;

pub use client::{CallOutcome, RpcClient};
pub use error::ClientError;
pub use relay::RelayEngine;
pub use session::{BrokerSession, ConnectionState, SessionStats};
