//! Bus error taxonomy. Every kind is distinguishable at the boundary:
//! configuration errors are fatal at startup, dispatch errors are captured
//! per message and never tear down a partition, requester-side errors fault
//! the pending awaiter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageBusError {
    /// Invalid topology, mismatched checkpoint settings across a
    /// `(path, group)`, duplicate request handler. Surfaced at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Payload or header decode/encode failed.
    #[error("serialization error: {0}")]
    Serialization(#[source] anyhow::Error),

    /// The resolved message type matches no subscriber and the endpoint's
    /// undeclared-type policy is `Fail`.
    #[error("message type '{message_type}' is not declared on endpoint '{path}'")]
    UndeclaredMessageType { message_type: String, path: String },

    /// The application consumer or handler returned an error.
    #[error("handler error: {0}")]
    Handler(#[source] anyhow::Error),

    /// Delivered via the transport adapter; individual message transport
    /// errors do not tear down the partition.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// No response arrived before the request deadline.
    #[error("request '{request_id}' timed out")]
    RequestTimeout { request_id: String },

    /// The request was cancelled on the requester side.
    #[error("request was cancelled")]
    Cancelled,

    /// The remote handler faulted; the error text travelled back in the
    /// response `Error` header.
    #[error("remote handler fault: {0}")]
    RemoteFault(String),
}

impl MessageBusError {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        MessageBusError::Configuration(msg.into())
    }
}
