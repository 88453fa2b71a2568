//! Handle repositories.
//!
//! A repository maps identifiers of one [`HandleType`] to small integer
//! handles. Contacts and groups use [`DynamicRepo`], which interns
//! identifiers on demand and recycles handles once nothing refers to them.
//! Lists use [`StaticRepo`], whose handles are fixed for the lifetime of the
//! connection.
//!
//! A handle stays alive while it has internal references (taken by
//! [`HandleRepository::intern`] and [`HandleRepository::ref_handle`]) or
//! client holds (taken per bus client by [`HandleRepository::client_hold`]).
//! After [`HandleRepository::invalidate`] every operation fails with
//! `Disconnected`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tpcm_core::{Handle, HandleType, ListName, TpError, TpResult};
use tracing::{debug, trace};

/// Normalizes a raw identifier, or rejects it with `InvalidHandle`.
pub type NormalizeFn = Box<dyn Fn(&str) -> TpResult<String> + Send + Sync>;

/// Storage for the handles of one kind.
pub trait HandleRepository: Send {
    fn kind(&self) -> HandleType;

    /// True if `handle` currently names an identifier.
    fn is_valid(&self, handle: Handle) -> bool;

    /// Identifier of a live handle.
    fn inspect(&self, handle: Handle) -> TpResult<String>;

    /// Handle of an already-interned identifier, or [`Handle::NONE`].
    fn lookup(&self, id: &str) -> TpResult<Handle>;

    /// Normalizes `id` and returns its handle, allocating one if needed.
    /// The caller owns one internal reference to the result.
    fn intern(&mut self, id: &str) -> TpResult<Handle>;

    fn ref_handle(&mut self, handle: Handle) -> TpResult<()>;

    /// Drops an internal reference; the handle is freed when nothing else
    /// keeps it alive.
    fn unref_handle(&mut self, handle: Handle) -> TpResult<()>;

    /// Records one hold of `handle` on behalf of bus client `client`.
    fn client_hold(&mut self, handle: Handle, client: &str) -> TpResult<()>;

    /// Drops one hold; `NotYours` if `client` holds none.
    fn client_release(&mut self, handle: Handle, client: &str) -> TpResult<()>;

    /// Number of holds `client` has on `handle`.
    fn client_holds(&self, handle: Handle, client: &str) -> u32;

    /// Drops every hold of a client that left the bus.
    fn client_vanished(&mut self, client: &str);

    /// Makes every later operation fail with `Disconnected`.
    fn invalidate(&mut self);

    /// Checks a batch of handles, optionally tolerating `0`.
    fn validate(&self, handles: &[Handle], allow_zero: bool) -> TpResult<()> {
        for &handle in handles {
            if handle.is_none() && allow_zero {
                continue;
            }
            if !self.is_valid(handle) {
                return Err(TpError::invalid_handle(format!(
                    "{} handle {handle} is not valid",
                    self.kind()
                )));
            }
        }
        Ok(())
    }
}

fn invalidated(kind: HandleType) -> TpError {
    TpError::disconnected(format!("{kind} handle repository is no longer usable"))
}

#[derive(Debug)]
struct Entry {
    id: String,
    refs: u32,
    holders: HashMap<String, u32>,
}

impl Entry {
    fn is_unused(&self) -> bool {
        self.refs == 0 && self.holders.is_empty()
    }
}

/// Repository that interns arbitrary identifiers.
///
/// Freed handles are reused smallest first; freeing the highest allocated
/// handle shrinks the allocation cursor instead.
pub struct DynamicRepo {
    kind: HandleType,
    normalize: NormalizeFn,
    entries: HashMap<Handle, Entry>,
    by_id: HashMap<String, Handle>,
    free: BTreeSet<u32>,
    next: u32,
    invalid: bool,
}

impl fmt::Debug for DynamicRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicRepo")
            .field("kind", &self.kind)
            .field("live", &self.entries.len())
            .field("next", &self.next)
            .field("invalid", &self.invalid)
            .finish()
    }
}

impl DynamicRepo {
    /// Repository that stores identifiers exactly as given.
    pub fn new(kind: HandleType) -> Self {
        Self::with_normalizer(kind, |id| {
            if id.is_empty() {
                Err(TpError::invalid_handle("empty identifier"))
            } else {
                Ok(id.to_string())
            }
        })
    }

    /// Repository whose identifiers go through `normalize` first.
    pub fn with_normalizer<F>(kind: HandleType, normalize: F) -> Self
    where
        F: Fn(&str) -> TpResult<String> + Send + Sync + 'static,
    {
        Self {
            kind,
            normalize: Box::new(normalize),
            entries: HashMap::new(),
            by_id: HashMap::new(),
            free: BTreeSet::new(),
            next: 1,
            invalid: false,
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> TpResult<()> {
        if self.invalid {
            Err(invalidated(self.kind))
        } else {
            Ok(())
        }
    }

    fn entry_mut(&mut self, handle: Handle) -> TpResult<&mut Entry> {
        self.check()?;
        let kind = self.kind;
        self.entries
            .get_mut(&handle)
            .ok_or_else(|| TpError::invalid_handle(format!("{kind} handle {handle} is not valid")))
    }

    fn allocate(&mut self) -> TpResult<Handle> {
        if let Some(raw) = self.free.pop_first() {
            return Ok(Handle::new(raw));
        }
        if self.next == u32::MAX {
            return Err(TpError::not_available(format!(
                "{} handle space exhausted",
                self.kind
            )));
        }
        let raw = self.next;
        self.next += 1;
        Ok(Handle::new(raw))
    }

    fn release_if_unused(&mut self, handle: Handle) {
        let unused = self.entries.get(&handle).is_some_and(Entry::is_unused);
        if !unused {
            return;
        }
        if let Some(entry) = self.entries.remove(&handle) {
            self.by_id.remove(&entry.id);
            trace!(kind = %self.kind, %handle, id = %entry.id, "freed handle");
        }
        if handle.get() + 1 == self.next {
            self.next -= 1;
            while self.next > 1 && self.free.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.free.insert(handle.get());
        }
    }
}

impl HandleRepository for DynamicRepo {
    fn kind(&self) -> HandleType {
        self.kind
    }

    fn is_valid(&self, handle: Handle) -> bool {
        !self.invalid && self.entries.contains_key(&handle)
    }

    fn inspect(&self, handle: Handle) -> TpResult<String> {
        self.check()?;
        self.entries
            .get(&handle)
            .map(|e| e.id.clone())
            .ok_or_else(|| {
                TpError::invalid_handle(format!("{} handle {handle} is not valid", self.kind))
            })
    }

    fn lookup(&self, id: &str) -> TpResult<Handle> {
        self.check()?;
        let Ok(normal) = (self.normalize)(id) else {
            return Ok(Handle::NONE);
        };
        Ok(self.by_id.get(&normal).copied().unwrap_or(Handle::NONE))
    }

    fn intern(&mut self, id: &str) -> TpResult<Handle> {
        self.check()?;
        let normal = (self.normalize)(id)?;
        if let Some(&handle) = self.by_id.get(&normal) {
            self.entry_mut(handle)?.refs += 1;
            return Ok(handle);
        }
        let handle = self.allocate()?;
        trace!(kind = %self.kind, %handle, id = %normal, "allocated handle");
        self.by_id.insert(normal.clone(), handle);
        self.entries.insert(
            handle,
            Entry {
                id: normal,
                refs: 1,
                holders: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn ref_handle(&mut self, handle: Handle) -> TpResult<()> {
        self.entry_mut(handle)?.refs += 1;
        Ok(())
    }

    fn unref_handle(&mut self, handle: Handle) -> TpResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.refs == 0 {
            return Err(TpError::inconsistent(format!(
                "{handle} has no internal references"
            )));
        }
        entry.refs -= 1;
        self.release_if_unused(handle);
        Ok(())
    }

    fn client_hold(&mut self, handle: Handle, client: &str) -> TpResult<()> {
        let entry = self.entry_mut(handle)?;
        *entry.holders.entry(client.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn client_release(&mut self, handle: Handle, client: &str) -> TpResult<()> {
        let kind = self.kind;
        let entry = self.entry_mut(handle)?;
        let Some(count) = entry.holders.get_mut(client) else {
            return Err(TpError::not_yours(format!(
                "{client} does not hold {kind} handle {handle}"
            )));
        };
        *count -= 1;
        if *count == 0 {
            entry.holders.remove(client);
        }
        self.release_if_unused(handle);
        Ok(())
    }

    fn client_holds(&self, handle: Handle, client: &str) -> u32 {
        self.entries
            .get(&handle)
            .and_then(|e| e.holders.get(client).copied())
            .unwrap_or(0)
    }

    fn client_vanished(&mut self, client: &str) {
        if self.invalid {
            return;
        }
        let held: Vec<Handle> = self
            .entries
            .iter_mut()
            .filter_map(|(&handle, entry)| entry.holders.remove(client).map(|_| handle))
            .collect();
        if !held.is_empty() {
            debug!(kind = %self.kind, client, count = held.len(), "dropping holds of vanished client");
        }
        for handle in held {
            self.release_if_unused(handle);
        }
    }

    fn invalidate(&mut self) {
        self.invalid = true;
        self.entries.clear();
        self.by_id.clear();
        self.free.clear();
    }
}

/// Repository over a fixed list of names, numbered from 1.
#[derive(Debug)]
pub struct StaticRepo {
    kind: HandleType,
    names: Vec<String>,
    holders: HashMap<(Handle, String), u32>,
    invalid: bool,
}

impl StaticRepo {
    pub fn new<I, S>(kind: HandleType, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            names: names.into_iter().map(Into::into).collect(),
            holders: HashMap::new(),
            invalid: false,
        }
    }

    /// The repository of the four contact lists.
    pub fn lists() -> Self {
        Self::new(HandleType::List, ListName::ALL.iter().map(|l| l.as_str()))
    }

    fn check(&self, handle: Handle) -> TpResult<()> {
        if self.invalid {
            return Err(invalidated(self.kind));
        }
        if self.is_valid(handle) {
            Ok(())
        } else {
            Err(TpError::invalid_handle(format!(
                "{} handle {handle} is not valid",
                self.kind
            )))
        }
    }
}

impl HandleRepository for StaticRepo {
    fn kind(&self) -> HandleType {
        self.kind
    }

    fn is_valid(&self, handle: Handle) -> bool {
        !self.invalid && handle.get() >= 1 && (handle.get() as usize) <= self.names.len()
    }

    fn inspect(&self, handle: Handle) -> TpResult<String> {
        self.check(handle)?;
        Ok(self.names[handle.get() as usize - 1].clone())
    }

    fn lookup(&self, id: &str) -> TpResult<Handle> {
        if self.invalid {
            return Err(invalidated(self.kind));
        }
        Ok(self
            .names
            .iter()
            .position(|n| n == id)
            .map(|i| Handle::new(i as u32 + 1))
            .unwrap_or(Handle::NONE))
    }

    fn intern(&mut self, id: &str) -> TpResult<Handle> {
        let handle = self.lookup(id)?;
        if handle.is_none() {
            return Err(TpError::invalid_handle(format!(
                "{id:?} is not a {} name",
                self.kind
            )));
        }
        Ok(handle)
    }

    fn ref_handle(&mut self, handle: Handle) -> TpResult<()> {
        self.check(handle)
    }

    fn unref_handle(&mut self, handle: Handle) -> TpResult<()> {
        self.check(handle)
    }

    fn client_hold(&mut self, handle: Handle, client: &str) -> TpResult<()> {
        self.check(handle)?;
        *self
            .holders
            .entry((handle, client.to_string()))
            .or_insert(0) += 1;
        Ok(())
    }

    fn client_release(&mut self, handle: Handle, client: &str) -> TpResult<()> {
        self.check(handle)?;
        let key = (handle, client.to_string());
        match self.holders.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.holders.remove(&key);
                }
                Ok(())
            }
            None => Err(TpError::not_yours(format!(
                "{client} does not hold {} handle {handle}",
                self.kind
            ))),
        }
    }

    fn client_holds(&self, handle: Handle, client: &str) -> u32 {
        self.holders
            .get(&(handle, client.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn client_vanished(&mut self, client: &str) {
        self.holders.retain(|(_, holder), _| holder != client);
    }

    fn invalidate(&mut self) {
        self.invalid = true;
        self.holders.clear();
    }
}

/// The repositories of one connection, keyed by handle type.
///
/// A contact repository is always present.
pub struct HandleRepos {
    contacts: Box<dyn HandleRepository>,
    others: HashMap<HandleType, Box<dyn HandleRepository>>,
}

impl fmt::Debug for HandleRepos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.others.keys().collect();
        kinds.sort();
        f.debug_struct("HandleRepos").field("extra_kinds", &kinds).finish()
    }
}

impl HandleRepos {
    /// Repositories with just a contact repository.
    pub fn new(contacts: impl HandleRepository + 'static) -> Self {
        Self {
            contacts: Box::new(contacts),
            others: HashMap::new(),
        }
    }

    /// Contacts, lists and groups: what a contact-list-capable protocol needs.
    pub fn with_contact_lists(contacts: impl HandleRepository + 'static) -> Self {
        Self::new(contacts)
            .with(StaticRepo::lists())
            .with(DynamicRepo::new(HandleType::Group))
    }

    /// Adds (or replaces) the repository for its kind.
    pub fn with(mut self, repo: impl HandleRepository + 'static) -> Self {
        match repo.kind() {
            HandleType::Contact => self.contacts = Box::new(repo),
            kind => {
                self.others.insert(kind, Box::new(repo));
            }
        }
        self
    }

    pub fn supports(&self, kind: HandleType) -> bool {
        kind == HandleType::Contact || self.others.contains_key(&kind)
    }

    pub fn get(&self, kind: HandleType) -> TpResult<&dyn HandleRepository> {
        if kind == HandleType::Contact {
            return Ok(self.contacts.as_ref());
        }
        self.others
            .get(&kind)
            .map(|r| r.as_ref())
            .ok_or_else(|| unsupported(kind))
    }

    pub fn get_mut(&mut self, kind: HandleType) -> TpResult<&mut dyn HandleRepository> {
        if kind == HandleType::Contact {
            return Ok(self.contacts.as_mut());
        }
        match self.others.get_mut(&kind) {
            Some(repo) => Ok(repo.as_mut()),
            None => Err(unsupported(kind)),
        }
    }

    pub fn contacts(&mut self) -> &mut dyn HandleRepository {
        self.contacts.as_mut()
    }

    /// Drops every hold of `client` in every repository.
    pub fn client_vanished(&mut self, client: &str) {
        self.contacts.client_vanished(client);
        for repo in self.others.values_mut() {
            repo.client_vanished(client);
        }
    }

    pub fn invalidate_all(&mut self) {
        self.contacts.invalidate();
        for repo in self.others.values_mut() {
            repo.invalidate();
        }
    }
}

fn unsupported(kind: HandleType) -> TpError {
    TpError::not_implemented(format!("handle type {kind} is not supported"))
}

/// A set of handles that keeps one internal reference per member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleSet {
    members: BTreeSet<Handle>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle`, taking a reference. Returns false if already present.
    pub fn add(&mut self, repo: &mut dyn HandleRepository, handle: Handle) -> TpResult<bool> {
        if self.members.contains(&handle) {
            return Ok(false);
        }
        repo.ref_handle(handle)?;
        self.members.insert(handle);
        Ok(true)
    }

    /// Removes `handle`, dropping its reference. Returns false if absent.
    pub fn remove(&mut self, repo: &mut dyn HandleRepository, handle: Handle) -> TpResult<bool> {
        if !self.members.remove(&handle) {
            return Ok(false);
        }
        repo.unref_handle(handle)?;
        Ok(true)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.members.contains(&handle)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.members.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<Handle> {
        self.members.iter().copied().collect()
    }

    /// Empties the set, releasing every reference. Errors from an already
    /// invalidated repository are ignored.
    pub fn clear(&mut self, repo: &mut dyn HandleRepository) {
        for handle in std::mem::take(&mut self.members) {
            let _ = repo.unref_handle(handle);
        }
    }
}
