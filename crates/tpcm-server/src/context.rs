//! Process context: the bus a manager publishes on.
//!
//! Nothing in the framework reaches for a global bus. A [`Context`] is
//! created once per process and handed to the manager and every
//! connection; tests build one over an [`InMemoryBus`] and inspect it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tpcm_core::{Emitter, Subscription};
use tracing::debug;

/// Outcome of a name request, with the bus's numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

/// A well-known name changed hands. Empty strings mean "nobody".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

/// The operations the framework needs from a message bus.
pub trait Bus: Send + Sync {
    /// Unique name of this process on the bus.
    fn unique_name(&self) -> String;

    /// Requests `name` without queueing behind another owner.
    fn request_name(&self, name: &str) -> RequestNameReply;

    /// Releases `name`; false if this process did not own it.
    fn release_name(&self, name: &str) -> bool;

    /// Current owner of `name`, if any.
    fn name_owner(&self, name: &str) -> Option<String>;

    fn subscribe_name_owner_changed(&self) -> Subscription<NameOwnerChanged>;
}

#[derive(Debug, Default)]
struct BusState {
    owners: HashMap<String, String>,
    clients: Vec<String>,
    next_client: u64,
    changes: Emitter<NameOwnerChanged>,
}

/// A bus living entirely inside the process.
///
/// Besides the [`Bus`] operations for the manager itself, it lets tests
/// connect and disconnect other clients and claim names on their behalf.
#[derive(Clone)]
pub struct InMemoryBus {
    own_name: String,
    state: Arc<Mutex<BusState>>,
}

impl fmt::Debug for InMemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBus")
            .field("own_name", &self.own_name)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(BusState::default()));
        let own_name = Self::allocate_client(&mut state.lock());
        Self { own_name, state }
    }

    fn allocate_client(state: &mut BusState) -> String {
        state.next_client += 1;
        let name = format!(":1.{}", state.next_client);
        state.clients.push(name.clone());
        name
    }

    /// Connects another client and returns its unique name.
    pub fn connect_client(&self) -> String {
        let mut state = self.state.lock();
        let name = Self::allocate_client(&mut state);
        state.changes.emit(NameOwnerChanged {
            name: name.clone(),
            old_owner: String::new(),
            new_owner: name.clone(),
        });
        name
    }

    /// Disconnects a client: its well-known names are released, then its
    /// unique name disappears.
    pub fn disconnect_client(&self, client: &str) {
        let mut state = self.state.lock();
        let before = state.clients.len();
        state.clients.retain(|c| c != client);
        if state.clients.len() == before {
            return;
        }
        let owned: Vec<String> = state
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == client)
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            state.owners.remove(&name);
            state.changes.emit(NameOwnerChanged {
                name,
                old_owner: client.to_string(),
                new_owner: String::new(),
            });
        }
        state.changes.emit(NameOwnerChanged {
            name: client.to_string(),
            old_owner: client.to_string(),
            new_owner: String::new(),
        });
        debug!(client, "bus client disconnected");
    }

    /// Requests `name` for `client`.
    pub fn request_name_for(&self, client: &str, name: &str) -> RequestNameReply {
        let mut state = self.state.lock();
        match state.owners.get(name) {
            Some(owner) if owner == client => RequestNameReply::AlreadyOwner,
            Some(_) => RequestNameReply::Exists,
            None => {
                state.owners.insert(name.to_string(), client.to_string());
                state.changes.emit(NameOwnerChanged {
                    name: name.to_string(),
                    old_owner: String::new(),
                    new_owner: client.to_string(),
                });
                RequestNameReply::PrimaryOwner
            }
        }
    }

    /// Every well-known name currently owned, sorted.
    pub fn owned_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().owners.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Bus for InMemoryBus {
    fn unique_name(&self) -> String {
        self.own_name.clone()
    }

    fn request_name(&self, name: &str) -> RequestNameReply {
        self.request_name_for(&self.own_name, name)
    }

    fn release_name(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        if state.owners.get(name) != Some(&self.own_name) {
            return false;
        }
        state.owners.remove(name);
        state.changes.emit(NameOwnerChanged {
            name: name.to_string(),
            old_owner: self.own_name.clone(),
            new_owner: String::new(),
        });
        true
    }

    fn name_owner(&self, name: &str) -> Option<String> {
        let state = self.state.lock();
        if state.clients.iter().any(|c| c == name) {
            return Some(name.to_string());
        }
        state.owners.get(name).cloned()
    }

    fn subscribe_name_owner_changed(&self) -> Subscription<NameOwnerChanged> {
        self.state.lock().changes.subscribe()
    }
}

/// Shared per-process state: the bus and the counter behind anonymous
/// connection names.
#[derive(Clone)]
pub struct Context {
    bus: Arc<dyn Bus>,
    anonymous: Arc<AtomicU64>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("unique_name", &self.bus.unique_name())
            .field("anonymous", &self.anonymous.load(Ordering::Relaxed))
            .finish()
    }
}

impl Context {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            anonymous: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A context over a fresh [`InMemoryBus`], returned alongside it.
    pub fn in_memory() -> (Self, InMemoryBus) {
        let bus = InMemoryBus::new();
        (Self::new(Arc::new(bus.clone())), bus)
    }

    pub fn bus(&self) -> &dyn Bus {
        self.bus.as_ref()
    }

    /// Next value of the process-wide counter for connections whose
    /// transport offers no unique name.
    pub fn next_anonymous(&self) -> u64 {
        self.anonymous.fetch_add(1, Ordering::Relaxed)
    }
}
