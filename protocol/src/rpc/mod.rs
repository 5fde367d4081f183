//! # RPC Module
//!
//! The agent-to-agent call protocol. Peers exchange signed [`Envelope`]s on
//! each other's inbound subjects; replies are matched to calls strictly by
//! request id.
//!
//! ## Architecture
//!
//! ```text
//! envelope.rs   Wire format, signing, error codes
//! pending.rs    Outstanding calls keyed by request id
//! engine.rs     Outbound calls, streaming calls, inbound handler dispatch
//! ```

pub mod engine;
pub mod envelope;
pub mod pending;

pub use engine::{
    CallStream, HandlerResult, InboundRequest, RpcEngine, RpcOptions, StreamSink,
    STREAM_BUFFER, WILDCARD_ACTION,
};
pub use envelope::{
    Envelope, EnvelopeError, EnvelopeKind, RemoteFault, ERR_AUTH, ERR_HANDLER,
    ERR_INVALID_PARAMS, ERR_UNKNOWN_ACTION,
};
pub use pending::{Completion, PendingTable, Resolution, StreamSlot};
