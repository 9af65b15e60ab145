//! Omnibus
//!
//! A transport-agnostic message bus: typed publish/subscribe and
//! request/response messaging over pluggable broker transports. The core is
//! the consumption and dispatch engine (partition lifecycle, per-message
//! dispatch, interceptor pipeline) plus the request/response correlator;
//! concrete broker clients plug in behind the [`transport`] traits.

use std::any::Any;
use std::sync::Arc;

pub use anyhow::{
    Context as ErrorContext, Error, Ok as OK, Result, anyhow as error, bail as raise,
};

mod config;
pub use config::BusConfig;

pub mod bus;
pub mod consumer;
pub mod error;
pub mod headers;
pub mod interceptor;
pub mod locator;
pub mod logging;
pub mod registry;
pub mod request;
pub mod serializer;
pub mod time;
pub mod transport;

pub use bus::{MessageBus, MessageBusBuilder, ProduceOptions, SendOptions};
pub use error::MessageBusError;
pub use tokio_util::sync::CancellationToken;

/// An application message, erased. The core stays generic over an opaque
/// message object plus its declared type; typed adapters recover the
/// concrete type at the edges.
pub type AnyMessage = Arc<dyn Any + Send + Sync>;
