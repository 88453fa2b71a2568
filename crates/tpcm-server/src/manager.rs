//! The connection manager process object.
//!
//! A [`ConnectionManager`] knows a set of protocols, each backed by a
//! [`ProtocolPlugin`], and owns every connection made through it. It claims
//! `<base>.ConnectionManager.<name>` on the bus, validates connection
//! parameters against the protocol descriptors, and forgets connections
//! once they finish shutting down.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Sleep;
use tpcm_core::{Emitter, ObjectPath, Subscription, TpError, TpResult, ValueMap};
use tpcm_protocol::{Manifest, Parameter, ProtocolDescriptor, find_in, validate_parameters};
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionBuilder};
use crate::context::Context;
use crate::error::ServerResult;
use crate::registrar::{self, BusNames};
use crate::signals::SignalHandler;

/// A connection shared between the manager and whoever drives it.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// A protocol the manager can make connections for.
pub trait ProtocolPlugin: Send + Sync {
    fn descriptor(&self) -> &ProtocolDescriptor;

    /// Builds a connection in NEW. `builder` already carries the context,
    /// the manager and protocol names and the bus base; `params` has been
    /// validated and has defaults filled in.
    fn new_connection(&self, builder: ConnectionBuilder, params: &ValueMap) -> TpResult<Connection>;
}

/// Events of the manager itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    NewConnection {
        bus_name: String,
        object_path: ObjectPath,
        protocol: String,
    },
    /// The last connection finished shutting down.
    NoMoreConnections,
}

enum Step {
    Shutdown,
    Reload,
    Reaped(Option<String>),
    ClientGone(String),
    Idle,
}

pub struct ConnectionManager {
    config: ManagerConfig,
    context: Context,
    protocols: BTreeMap<String, Arc<dyn ProtocolPlugin>>,
    connections: BTreeMap<String, SharedConnection>,
    names: Option<BusNames>,
    events: Emitter<ManagerEvent>,
    reaped_tx: mpsc::UnboundedSender<String>,
    reaped_rx: mpsc::UnboundedReceiver<String>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, context: Context) -> Self {
        let (reaped_tx, reaped_rx) = mpsc::unbounded_channel();
        Self {
            config,
            context,
            protocols: BTreeMap::new(),
            connections: BTreeMap::new(),
            names: None,
            events: Emitter::new(),
            reaped_tx,
            reaped_rx,
        }
    }

    /// Adds a protocol. A later plugin for the same name replaces the
    /// earlier one.
    pub fn with_protocol(mut self, plugin: impl ProtocolPlugin + 'static) -> Self {
        let name = plugin.descriptor().name().to_string();
        if self.protocols.insert(name.clone(), Arc::new(plugin)).is_some() {
            warn!(protocol = %name, "replacing protocol plugin");
        }
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> Subscription<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn list_protocols(&self) -> Vec<String> {
        self.protocols.keys().cloned().collect()
    }

    pub fn protocol(&self, name: &str) -> TpResult<&ProtocolDescriptor> {
        self.protocols
            .get(name)
            .map(|plugin| plugin.descriptor())
            .ok_or_else(|| TpError::not_implemented(format!("unknown protocol {name:?}")))
    }

    pub fn get_parameters(&self, protocol: &str) -> TpResult<&[Parameter]> {
        Ok(self.protocol(protocol)?.params())
    }

    /// Claims the manager's bus name.
    pub fn register(&mut self) -> TpResult<&BusNames> {
        if self.names.is_none() {
            let names = registrar::manager_names(&self.config.bus_base, &self.config.name)?;
            registrar::claim(&self.context, &names)?;
            info!(bus_name = %names.bus_name, protocols = self.protocols.len(), "manager registered");
            self.names = Some(names);
        }
        self.names
            .as_ref()
            .ok_or_else(|| TpError::inconsistent("manager names vanished"))
    }

    /// Makes and registers a connection, returning its names.
    ///
    /// The connection starts in NEW; the caller connects it through the
    /// returned names with [`ConnectionManager::connection`]. Must run
    /// inside a Tokio runtime, which watches for the connection's end.
    #[tracing::instrument(skip(self, params), fields(manager = %self.config.name))]
    pub fn request_connection(&mut self, protocol: &str, params: &ValueMap) -> TpResult<BusNames> {
        self.poll_reaped();
        let plugin = self
            .protocols
            .get(protocol)
            .cloned()
            .ok_or_else(|| TpError::not_implemented(format!("unknown protocol {protocol:?}")))?;
        let params = validate_parameters(plugin.descriptor().params(), params)?;

        let builder = Connection::builder(&self.context, &self.config.name, protocol)
            .with_bus_base(&self.config.bus_base);
        let mut connection = plugin.new_connection(builder, &params)?;
        let names = connection.register()?.clone();

        let waiter = connection.disconnect_waiter();
        let reaped_tx = self.reaped_tx.clone();
        let bus_name = names.bus_name.clone();
        tokio::spawn(async move {
            waiter.wait().await;
            let _ = reaped_tx.send(bus_name);
        });

        info!(bus_name = %names.bus_name, "new connection");
        self.connections
            .insert(names.bus_name.clone(), Arc::new(Mutex::new(connection)));
        self.events.emit(ManagerEvent::NewConnection {
            bus_name: names.bus_name.clone(),
            object_path: names.object_path.clone(),
            protocol: protocol.to_string(),
        });
        Ok(names)
    }

    pub fn connection(&mut self, bus_name: &str) -> Option<SharedConnection> {
        self.poll_reaped();
        self.connections.get(bus_name).cloned()
    }

    /// Bus names of the live connections.
    pub fn connections(&mut self) -> Vec<String> {
        self.poll_reaped();
        self.connections.keys().cloned().collect()
    }

    fn poll_reaped(&mut self) {
        while let Ok(bus_name) = self.reaped_rx.try_recv() {
            self.reap(&bus_name);
        }
    }

    fn reap(&mut self, bus_name: &str) {
        if self.connections.remove(bus_name).is_none() {
            return;
        }
        debug!(bus_name, remaining = self.connections.len(), "connection finished");
        if self.connections.is_empty() {
            info!("no more connections");
            self.events.emit(ManagerEvent::NoMoreConnections);
        }
    }

    /// Drops the handle holds of a bus client on every connection.
    pub async fn client_vanished(&mut self, client: &str) {
        for connection in self.connections.values() {
            connection.lock().await.client_vanished(client);
        }
    }

    /// The manifest describing this manager and its protocols.
    pub fn to_manifest(&self) -> TpResult<Manifest> {
        let names = registrar::manager_names(&self.config.bus_base, &self.config.name)?;
        Ok(self.protocols.values().fold(
            Manifest::new()
                .with_manager_entry("BusName", names.bus_name)
                .with_manager_entry("ObjectPath", names.object_path.as_str()),
            |manifest, plugin| manifest.with_protocol(plugin.descriptor().clone()),
        ))
    }

    /// Compares the installed manifest with the registered protocols,
    /// warning about every difference. Returns how many were found, or
    /// `None` if no manifest is installed.
    pub fn check_manifest(&self) -> ServerResult<Option<usize>> {
        let dirs = self.config.manifest_search_dirs();
        let Some(path) = find_in(&self.config.name, &dirs) else {
            debug!(manager = %self.config.name, "no installed manifest");
            return Ok(None);
        };
        let installed = Manifest::load(&path)?;
        let mut differences = 0;
        for (name, plugin) in &self.protocols {
            match installed.protocol(name) {
                Some(descriptor) if descriptor == plugin.descriptor() => {}
                Some(_) => {
                    warn!(path = %path.display(), protocol = %name, "installed manifest describes protocol differently");
                    differences += 1;
                }
                None => {
                    warn!(path = %path.display(), protocol = %name, "installed manifest lacks protocol");
                    differences += 1;
                }
            }
        }
        for descriptor in installed.protocols() {
            if !self.protocols.contains_key(descriptor.name()) {
                warn!(path = %path.display(), protocol = %descriptor.name(), "installed manifest lists unknown protocol");
                differences += 1;
            }
        }
        Ok(Some(differences))
    }

    /// Disconnects every connection, waits up to the grace period for them
    /// to finish, then releases the manager's name.
    pub async fn shutdown(&mut self) {
        let connections: Vec<SharedConnection> = self.connections.values().cloned().collect();
        info!(connections = connections.len(), "shutting down");

        let mut tasks = JoinSet::new();
        for connection in connections {
            tasks.spawn(async move {
                connection.lock().await.disconnect().await;
            });
        }
        let grace = self.config.shutdown_grace();
        let deadline = tokio::time::Instant::now() + grace;
        let drained = tokio::time::timeout_at(deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "connections did not finish disconnecting in time");
            tasks.abort_all();
        }

        // each connection's watcher task reports it once shutdown finished
        let reaped = tokio::time::timeout_at(deadline, async {
            while !self.connections.is_empty() {
                match self.reaped_rx.recv().await {
                    Some(bus_name) => self.reap(&bus_name),
                    None => break,
                }
            }
        })
        .await;
        if reaped.is_err() {
            warn!(remaining = self.connections.len(), "connections were not reaped in time");
        }
        if let Some(names) = self.names.take() {
            registrar::release(&self.context, &names);
        }
    }

    /// Runs until a shutdown signal, or until the idle timeout passes with
    /// no connections. Reload signals re-check the installed manifest;
    /// clients leaving the bus lose their handle holds.
    pub async fn run_until_shutdown(&mut self, signals: &SignalHandler) -> ServerResult<()> {
        let shutdown = signals.shutdown().wait();
        tokio::pin!(shutdown);
        let mut reload = signals.reload();
        let mut owners = self.context.bus().subscribe_name_owner_changed();

        let idle_timeout = self.config.idle_timeout();
        let mut idle: Option<Pin<Box<Sleep>>> = None;
        loop {
            match idle_timeout {
                Some(timeout) if self.connections.is_empty() => {
                    // keeps counting across reloads and vanished clients
                    if idle.is_none() {
                        idle = Some(Box::pin(tokio::time::sleep(timeout)));
                    }
                }
                _ => idle = None,
            }
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                _ = reload.next() => Step::Reload,
                bus_name = self.reaped_rx.recv() => Step::Reaped(bus_name),
                Some(change) = owners.recv() => {
                    if change.name.starts_with(':') && change.new_owner.is_empty() {
                        Step::ClientGone(change.name)
                    } else {
                        continue;
                    }
                }
                _ = idle_timer(idle.as_mut()) => Step::Idle,
            };
            match step {
                Step::Shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Step::Idle => {
                    info!(timeout = ?idle_timeout, "idle with no connections, exiting");
                    break;
                }
                Step::Reload => {
                    if let Err(error) = self.check_manifest() {
                        warn!(%error, "cannot check installed manifest");
                    }
                }
                Step::Reaped(Some(bus_name)) => self.reap(&bus_name),
                Step::Reaped(None) => {}
                Step::ClientGone(client) => {
                    debug!(%client, "bus client vanished");
                    self.client_vanished(&client).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}

async fn idle_timer(timer: Option<&mut Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(names) = self.names.take() {
            registrar::release(&self.context, &names);
        }
    }
}
