//! Core types: handles, errors, status, value maps, escaping, events, tracing

pub mod error;
pub mod escape;
pub mod event;
pub mod handle;
pub mod object_path;
pub mod status;
pub mod tracing;
pub mod value_map;

use std::future::Future;
use std::pin::Pin;

pub use error::{TpError, TpResult};
pub use escape::{
    escape_as_identifier, escape_protocol, is_valid_protocol_name, unescape_identifier,
    unescape_protocol,
};
pub use event::{Emitter, Subscription};
pub use handle::{Handle, HandleType, ListName};
pub use object_path::{ObjectPath, is_valid_object_path};
pub use status::{ConnectionStatus, StatusReason};
pub use tracing::{LogConfig, LogFormat, LogInitError, init_tracing};
pub use value_map::{ValueMap, Variant};

/// Boxed future used at object-safe async trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Well-known prefix shared by bus names and object paths.
pub const BUS_BASE: &str = "org.freedesktop.Telepathy";
