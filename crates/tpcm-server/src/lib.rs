//! Connection runtime for Telepathy-style connection managers.
//!
//! This crate provides what a protocol implementation plugs into:
//! - handle repositories with client holds ([`DynamicRepo`], [`StaticRepo`])
//! - the connection state machine and its channel request queue
//!   ([`Connection`], [`ChannelFactory`])
//! - contact lists and groups over a protocol's roster cache
//!   ([`ContactListManager`])
//! - the manager process object, bus names, configuration and signals
//!
//! # Example
//!
//! ```rust,no_run
//! use tpcm_server::{ConnectionManager, Context, ManagerConfig, SignalHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ManagerConfig::load_or_default("example", ManagerConfig::default_path("example"))?;
//!     tpcm_core::init_tracing(config.log_config())?;
//!
//!     let (context, _bus) = Context::in_memory();
//!     let mut manager = ConnectionManager::new(config, context);
//!     manager.register()?;
//!
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     manager.run_until_shutdown(&signals).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod contact_list;
mod context;
mod error;
mod factory;
mod manager;
mod registrar;
mod repo;
mod requests;
mod signals;

pub use config::ManagerConfig;
pub use connection::{
    Connection, ConnectionBuilder, ConnectionEvent, DisconnectWaiter, ReadyConnection, Transport,
};
pub use contact_list::{
    BlockableContactList, CONTACT_LIST_CHANNEL_TYPE, ContactGroups, ContactListBackend,
    ContactListEvent, ContactListManager, ContactListView, ContactStates, ListFuture,
    MembershipChange, MutableContactGroups, MutableContactList, SubscriptionState,
    list_channel_path,
};
pub use context::{Bus, Context, InMemoryBus, NameOwnerChanged, RequestNameReply};
pub use error::{ServerError, ServerResult};
pub use factory::{
    AsAny, ChannelFactory, FactoryContext, FactoryEvent, FactoryId, RequestStatus,
};
pub use manager::{ConnectionManager, ManagerEvent, ProtocolPlugin, SharedConnection};
pub use registrar::{
    BusNames, connection_names, is_valid_bus_name, is_valid_manager_name, manager_names,
};
pub use repo::{DynamicRepo, HandleRepos, HandleRepository, HandleSet, NormalizeFn, StaticRepo};
pub use requests::{
    ChannelInfo, ChannelReply, ChannelRequest, PendingRequest, RequestQueue, RequestToken,
};
pub use signals::{ReloadSignal, ShutdownSignal, SignalHandler};
