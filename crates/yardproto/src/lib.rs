//! yardproto - Envelope and topic types for the switchyard RPC runtime
//!
//! This crate defines the JSON envelopes exchanged over the MQTT bus
//! (requests, responses, notifications), the transaction-id minter used to
//! correlate them, and the topic grammar that routes them. Everything that
//! touches the wire format lives here so that fixing a framing issue fixes
//! it for every consumer.

pub mod envelope;
pub mod topic;
pub mod txid;

pub use envelope::{
    Authority, DecodeError, DecodeErrorKind, Notification, RpcRequest, RpcResponse,
};
pub use topic::{topic_matches, TopicConfig, TopicParts};
pub use txid::{is_valid_transaction_id, mint_transaction_id};
