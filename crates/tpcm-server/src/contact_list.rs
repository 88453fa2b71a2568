//! Contact lists and groups.
//!
//! A [`ContactListManager`] sits between a protocol's roster cache (the
//! [`ContactListBackend`]) and clients. It presents the roster as four list
//! views (`subscribe`, `publish`, `stored`, `deny`) plus one view per
//! user-defined group, and turns backend notifications into batched
//! [`MembershipChange`] events.
//!
//! Nothing is emitted until the backend has the whole roster and the
//! protocol calls [`ContactListManager::set_list_received`]. Requests for
//! list or group channels made before then are answered `Queued` and
//! complete when the views appear.
//!
//! Backends opt into mutation through capability accessors. Operations a
//! backend cannot perform succeed without doing anything, so callers can
//! treat every protocol alike.

use std::collections::BTreeMap;

use tpcm_core::{
    BoxFuture, Emitter, Handle, HandleType, ListName, ObjectPath, Subscription, TpError, TpResult,
};
use tracing::{debug, info, warn};

use crate::factory::{ChannelFactory, FactoryContext, RequestStatus};
use crate::repo::{HandleRepository, HandleSet};
use crate::requests::{ChannelInfo, ChannelRequest, RequestToken};

/// Channel type of list and group views.
pub const CONTACT_LIST_CHANNEL_TYPE: &str = "org.freedesktop.Telepathy.Channel.Type.ContactList";

/// Outcome of a backend write.
pub type ListFuture = BoxFuture<'static, TpResult<()>>;

fn ready(result: TpResult<()>) -> ListFuture {
    Box::pin(std::future::ready(result))
}

/// Presence subscription state in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    #[default]
    No,
    /// Requested, not yet answered.
    Ask,
    Yes,
}

/// What the backend knows about one contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactStates {
    /// Do we receive their presence?
    pub subscribe: SubscriptionState,
    /// Do they receive ours?
    pub publish: SubscriptionState,
    /// Message that came with their request, when `publish` is `Ask`.
    pub publish_request: String,
}

impl ContactStates {
    pub fn new(subscribe: SubscriptionState, publish: SubscriptionState) -> Self {
        Self {
            subscribe,
            publish,
            publish_request: String::new(),
        }
    }

    pub fn with_publish_request(mut self, message: impl Into<String>) -> Self {
        self.publish_request = message.into();
        self
    }
}

/// Read access to a protocol's roster cache.
pub trait ContactListBackend: Send + 'static {
    /// Every contact in the cache.
    fn contacts(&self) -> Vec<Handle>;

    /// States of a cached contact, `None` if it is not cached.
    fn states(&self, contact: Handle) -> Option<ContactStates>;

    fn can_change_subscriptions(&self) -> bool {
        false
    }

    /// Whether subscription requests carry a message.
    fn request_uses_message(&self) -> bool {
        false
    }

    /// Whether the roster is stored server side. Without it there is no
    /// `stored` view.
    fn subscriptions_persist(&self) -> bool {
        true
    }

    fn mutable(&mut self) -> Option<&mut dyn MutableContactList> {
        None
    }

    fn blockable(&self) -> Option<&dyn BlockableContactList> {
        None
    }

    fn blockable_mut(&mut self) -> Option<&mut dyn BlockableContactList> {
        None
    }

    fn groups(&self) -> Option<&dyn ContactGroups> {
        None
    }

    fn groups_mut(&mut self) -> Option<&mut dyn MutableContactGroups> {
        None
    }
}

/// Roster writes.
pub trait MutableContactList: Send {
    fn request_subscription(&mut self, contacts: &[Handle], message: &str) -> ListFuture;
    fn authorize_publication(&mut self, contacts: &[Handle]) -> ListFuture;
    fn store_contacts(&mut self, contacts: &[Handle]) -> ListFuture;
    fn remove_contacts(&mut self, contacts: &[Handle]) -> ListFuture;
    fn unsubscribe(&mut self, contacts: &[Handle]) -> ListFuture;
    fn unpublish(&mut self, contacts: &[Handle]) -> ListFuture;
}

/// Blocking support.
pub trait BlockableContactList: Send {
    /// Blocking can be switched off at runtime (for example when the server
    /// lacks the extension). Without it there is no `deny` view.
    fn can_block(&self) -> bool {
        true
    }

    fn blocked_contacts(&self) -> Vec<Handle>;
    fn block_contacts(&mut self, contacts: &[Handle]) -> ListFuture;
    fn unblock_contacts(&mut self, contacts: &[Handle]) -> ListFuture;
}

/// Group reads.
pub trait ContactGroups: Send {
    fn groups(&self) -> Vec<String>;
    fn contact_groups(&self, contact: Handle) -> Vec<String>;

    /// Whether each contact is in at most one group.
    fn disjoint_groups(&self) -> bool {
        false
    }

    /// Canonical form of a group name, `None` if it is unusable.
    fn normalize_group(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

/// Group writes.
pub trait MutableContactGroups: Send {
    /// Creates empty groups. Many servers only know a group once it has a
    /// member, so the default does nothing.
    fn create_groups(&mut self, _names: &[String]) -> ListFuture {
        ready(Ok(()))
    }

    fn add_to_group(&mut self, group: &str, contacts: &[Handle]) -> ListFuture;
    fn remove_from_group(&mut self, group: &str, contacts: &[Handle]) -> ListFuture;
    fn set_group_members(&mut self, group: &str, contacts: &[Handle]) -> ListFuture;
    fn remove_group(&mut self, group: &str) -> ListFuture;
    fn rename_group(&mut self, old: &str, new: &str) -> ListFuture;
}

/// Which view a membership change belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContactListView {
    List(ListName),
    Group(String),
}

/// One batch of membership changes on one view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub view: Option<ContactListView>,
    pub added: Vec<Handle>,
    pub removed: Vec<Handle>,
    /// Contacts waiting for our answer, with their request message.
    pub local_pending: Vec<(Handle, String)>,
    /// Contacts we are waiting on.
    pub remote_pending: Vec<Handle>,
    pub message: String,
    pub actor: Handle,
}

impl MembershipChange {
    fn for_view(view: ContactListView) -> Self {
        Self {
            view: Some(view),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.local_pending.is_empty()
            && self.remote_pending.is_empty()
    }

    fn sort(&mut self) {
        self.added.sort();
        self.removed.sort();
        self.local_pending.sort();
        self.remote_pending.sort();
    }
}

/// Events observers of a contact list receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactListEvent {
    MembersChanged(MembershipChange),
    GroupsCreated(Vec<String>),
    GroupsRemoved(Vec<String>),
    /// Every member left `old` and joined `new` in one step.
    GroupRenamed {
        old: String,
        new: String,
        members: Vec<Handle>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListState {
    Waiting,
    Received,
    Gone,
}

#[derive(Debug)]
struct ListView {
    info: ChannelInfo,
    members: HandleSet,
    local_pending: HandleSet,
    remote_pending: HandleSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Members,
    LocalPending,
    RemotePending,
    Nowhere,
}

impl ListView {
    /// Moves `contact` into `slot` and out of the other sets. The new
    /// reference is taken first so the handle survives the move.
    fn place(
        &mut self,
        repo: &mut dyn HandleRepository,
        contact: Handle,
        slot: Slot,
    ) -> TpResult<()> {
        let sets = [
            (Slot::Members, &mut self.members),
            (Slot::LocalPending, &mut self.local_pending),
            (Slot::RemotePending, &mut self.remote_pending),
        ];
        let (target, others): (Vec<_>, Vec<_>) = sets.into_iter().partition(|(s, _)| *s == slot);
        for (_, set) in target {
            set.add(repo, contact)?;
        }
        for (_, set) in others {
            set.remove(repo, contact)?;
        }
        Ok(())
    }

    fn clear(&mut self, repo: &mut dyn HandleRepository) {
        self.members.clear(repo);
        self.local_pending.clear(repo);
        self.remote_pending.clear(repo);
    }
}

#[derive(Debug)]
struct GroupView {
    info: ChannelInfo,
    members: HandleSet,
}

enum Membership {
    Member,
    LocalPending(String),
    RemotePending,
    Outside,
}

/// Presents a backend's roster as list and group views.
pub struct ContactListManager<B: ContactListBackend> {
    backend: B,
    state: ListState,
    lists: BTreeMap<ListName, ListView>,
    groups: BTreeMap<String, GroupView>,
    queued: Vec<(RequestToken, ChannelRequest)>,
    events: Emitter<ContactListEvent>,
}

impl<B: ContactListBackend> ContactListManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: ListState::Waiting,
            lists: BTreeMap::new(),
            groups: BTreeMap::new(),
            queued: Vec::new(),
            events: Emitter::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn subscribe(&mut self) -> Subscription<ContactListEvent> {
        self.events.subscribe()
    }

    pub fn is_list_received(&self) -> bool {
        self.state == ListState::Received
    }

    /// Whether the backend promises each contact is in at most one group.
    pub fn disjoint_groups(&self) -> bool {
        self.backend
            .groups()
            .is_some_and(|groups| groups.disjoint_groups())
    }

    /// Current members of a list view; empty if the view does not exist.
    pub fn list_members(&self, list: ListName) -> Vec<Handle> {
        self.lists
            .get(&list)
            .map(|view| view.members.to_vec())
            .unwrap_or_default()
    }

    /// Current members of a group; empty if the group does not exist.
    pub fn group_members(&self, group: &str) -> Vec<Handle> {
        self.groups
            .get(group)
            .map(|view| view.members.to_vec())
            .unwrap_or_default()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    fn can_block(&self) -> bool {
        self.backend.blockable().is_some_and(|b| b.can_block())
    }

    fn has_view(&self, list: ListName) -> bool {
        match list {
            ListName::Subscribe | ListName::Publish => true,
            ListName::Stored => self.backend.subscriptions_persist(),
            ListName::Deny => self.can_block(),
        }
    }

    fn normalize_group(&self, name: &str) -> Option<String> {
        match self.backend.groups() {
            Some(groups) => groups.normalize_group(name),
            None if name.is_empty() => None,
            None => Some(name.to_string()),
        }
    }

    fn emit_change(&mut self, mut change: MembershipChange, always: bool) {
        if self.state != ListState::Received || (!always && change.is_empty()) {
            return;
        }
        change.sort();
        debug!(
            view = ?change.view,
            added = change.added.len(),
            removed = change.removed.len(),
            local_pending = change.local_pending.len(),
            remote_pending = change.remote_pending.len(),
            "membership changed"
        );
        self.events.emit(ContactListEvent::MembersChanged(change));
    }

    fn membership(&self, list: ListName, contact: Handle) -> Membership {
        if list == ListName::Deny {
            let blocked = self
                .backend
                .blockable()
                .is_some_and(|b| b.blocked_contacts().contains(&contact));
            return if blocked {
                Membership::Member
            } else {
                Membership::Outside
            };
        }
        let Some(states) = self.backend.states(contact) else {
            return Membership::Outside;
        };
        match (list, states.subscribe, states.publish) {
            (ListName::Stored, _, _) => Membership::Member,
            (ListName::Subscribe, SubscriptionState::Yes, _)
            | (ListName::Publish, _, SubscriptionState::Yes) => Membership::Member,
            (ListName::Subscribe, SubscriptionState::Ask, _) => Membership::RemotePending,
            (ListName::Publish, _, SubscriptionState::Ask) => {
                Membership::LocalPending(states.publish_request)
            }
            _ => Membership::Outside,
        }
    }

    /// Brings a list view in line with the backend for `contacts`.
    ///
    /// The initial batch reports every contact under its derived state;
    /// later batches report only real transitions.
    fn update_list(
        &mut self,
        list: ListName,
        contacts: &[Handle],
        repo: &mut dyn HandleRepository,
        initial: bool,
    ) -> Option<MembershipChange> {
        let memberships: Vec<(Handle, Membership)> = contacts
            .iter()
            .map(|&contact| (contact, self.membership(list, contact)))
            .collect();
        let view = self.lists.get_mut(&list)?;
        let mut change = MembershipChange::for_view(ContactListView::List(list));

        for (contact, membership) in memberships {
            let was_member = view.members.contains(contact);
            let was_local = view.local_pending.contains(contact);
            let was_remote = view.remote_pending.contains(contact);
            let slot = match membership {
                Membership::Member => {
                    if initial || !was_member {
                        change.added.push(contact);
                    }
                    Slot::Members
                }
                Membership::LocalPending(message) => {
                    if initial || !was_local {
                        change.local_pending.push((contact, message));
                    }
                    Slot::LocalPending
                }
                Membership::RemotePending => {
                    if initial || !was_remote {
                        change.remote_pending.push(contact);
                    }
                    Slot::RemotePending
                }
                Membership::Outside => {
                    if initial || was_member || was_local || was_remote {
                        change.removed.push(contact);
                    }
                    Slot::Nowhere
                }
            };
            let result = view.place(repo, contact, slot);
            if let Err(error) = result {
                warn!(%list, contact = contact.get(), %error, "backend reported an unusable contact handle");
            }
        }
        Some(change)
    }

    fn create_list_views(&mut self, ctx: &mut FactoryContext<'_>) -> TpResult<()> {
        for list in ListName::ALL {
            if !self.has_view(list) {
                continue;
            }
            let path = list_channel_path(ctx.connection_path(), list)?;
            let info = ChannelInfo::new(
                path,
                CONTACT_LIST_CHANNEL_TYPE,
                HandleType::List,
                list.handle(),
            );
            self.lists.insert(
                list,
                ListView {
                    info,
                    members: HandleSet::new(),
                    local_pending: HandleSet::new(),
                    remote_pending: HandleSet::new(),
                },
            );
        }
        Ok(())
    }

    /// Creates the view of a group not seen before and announces its
    /// channel. Returns false if it already existed.
    fn ensure_group(&mut self, ctx: &mut FactoryContext<'_>, name: &str) -> TpResult<bool> {
        if self.groups.contains_key(name) {
            return Ok(false);
        }
        let path = ctx.channel_path(&["ContactGroup", name])?;
        let handle = ctx.repos_mut().get_mut(HandleType::Group)?.intern(name)?;
        let info = ChannelInfo::new(path, CONTACT_LIST_CHANNEL_TYPE, HandleType::Group, handle);
        ctx.new_channel(info.clone(), None);
        self.groups.insert(
            name.to_string(),
            GroupView {
                info,
                members: HandleSet::new(),
            },
        );
        Ok(true)
    }

    fn drop_group(&mut self, ctx: &mut FactoryContext<'_>, name: &str) -> Option<Vec<Handle>> {
        let mut view = self.groups.remove(name)?;
        let members = view.members.to_vec();
        view.members.clear(ctx.repos_mut().contacts());
        if let Ok(repo) = ctx.repos_mut().get_mut(HandleType::Group) {
            let _ = repo.unref_handle(view.info.handle);
        }
        ctx.channel_closed(view.info.object_path);
        Some(members)
    }

    fn change_group(
        &mut self,
        ctx: &mut FactoryContext<'_>,
        name: &str,
        add: &[Handle],
        remove: &[Handle],
    ) {
        let Some(view) = self.groups.get_mut(name) else {
            return;
        };
        let repo = ctx.repos_mut().contacts();
        let mut change = MembershipChange::for_view(ContactListView::Group(name.to_string()));
        for &contact in add {
            match view.members.add(repo, contact) {
                Ok(true) => change.added.push(contact),
                Ok(false) => {}
                Err(error) => warn!(group = name, contact = contact.get(), %error, "cannot add contact to group"),
            }
        }
        for &contact in remove {
            if let Ok(true) = view.members.remove(repo, contact) {
                change.removed.push(contact);
            }
        }
        self.emit_change(change, false);
    }

    /// Publishes the roster. Call exactly once, when the backend's cache
    /// holds the whole roster.
    pub fn set_list_received(&mut self, ctx: &mut FactoryContext<'_>) {
        if self.state != ListState::Waiting {
            warn!("contact list was already received");
            return;
        }
        self.state = ListState::Received;
        if let Err(error) = self.create_list_views(ctx) {
            warn!(%error, "cannot create contact list views");
            return;
        }

        let contacts = self.backend.contacts();
        info!(contacts = contacts.len(), "contact list received");
        let blocked = self
            .backend
            .blockable()
            .filter(|b| b.can_block())
            .map(|b| b.blocked_contacts())
            .unwrap_or_default();

        for list in ListName::ALL {
            let members = if list == ListName::Deny {
                &blocked
            } else {
                &contacts
            };
            let change = self.update_list(list, members, ctx.repos_mut().contacts(), true);
            if let Some(change) = change {
                self.emit_change(change, true);
            }
        }

        let announced: Vec<ChannelInfo> = self.lists.values().map(|v| v.info.clone()).collect();
        for info in announced {
            ctx.new_channel(info, None);
        }

        let by_group = if ctx.repos().supports(HandleType::Group) {
            self.backend.groups().map(|groups| {
                let mut by_group: BTreeMap<String, Vec<Handle>> = groups
                    .groups()
                    .into_iter()
                    .filter_map(|g| groups.normalize_group(&g))
                    .map(|g| (g, Vec::new()))
                    .collect();
                for &contact in &contacts {
                    for group in groups.contact_groups(contact) {
                        if let Some(group) = groups.normalize_group(&group) {
                            by_group.entry(group).or_default().push(contact);
                        }
                    }
                }
                by_group
            })
        } else {
            debug!("no group repository, skipping groups");
            None
        };
        for (group, members) in by_group.unwrap_or_default() {
            if let Err(error) = self.ensure_group(ctx, &group) {
                warn!(group, %error, "cannot create group view");
                continue;
            }
            let repo = ctx.repos_mut().contacts();
            let mut change = MembershipChange::for_view(ContactListView::Group(group.clone()));
            if let Some(view) = self.groups.get_mut(&group) {
                for contact in members {
                    if let Ok(true) = view.members.add(repo, contact) {
                        change.added.push(contact);
                    }
                }
            }
            self.emit_change(change, true);
        }

        for (token, request) in std::mem::take(&mut self.queued) {
            self.finish_queued(ctx, token, &request);
        }
    }

    fn finish_queued(&mut self, ctx: &mut FactoryContext<'_>, token: RequestToken, request: &ChannelRequest) {
        if self.channels().iter().any(|c| c.satisfies(request)) {
            return;
        }
        let status = self.answer(request, ctx);
        match status {
            RequestStatus::Existing(_) | RequestStatus::Created(_) | RequestStatus::Queued => {}
            refusal => {
                let info = ChannelInfo::new(
                    ctx.connection_path().clone(),
                    request.channel_type.clone(),
                    request.handle_type,
                    request.handle,
                );
                ctx.channel_error(info, refusal.into_error(), Some(token));
            }
        }
    }

    /// Answers a request once the roster is known.
    fn answer(&mut self, request: &ChannelRequest, ctx: &mut FactoryContext<'_>) -> RequestStatus {
        match request.handle_type {
            HandleType::List => {
                let Some(list) = ListName::from_handle(request.handle) else {
                    return RequestStatus::InvalidHandle;
                };
                match self.lists.get(&list) {
                    Some(view) => RequestStatus::Existing(view.info.clone()),
                    None => RequestStatus::NotAvailable,
                }
            }
            HandleType::Group => {
                let name = match ctx
                    .repos()
                    .get(HandleType::Group)
                    .and_then(|repo| repo.inspect(request.handle))
                {
                    Ok(name) => name,
                    Err(error) => return RequestStatus::Error(error),
                };
                let Some(name) = self.normalize_group(&name) else {
                    return RequestStatus::InvalidHandle;
                };
                if let Some(view) = self.groups.get(&name) {
                    return RequestStatus::Existing(view.info.clone());
                }
                if self.backend.groups_mut().is_none() {
                    return RequestStatus::NotAvailable;
                }
                match self.ensure_group(ctx, &name) {
                    Ok(_) => {
                        self.events
                            .emit(ContactListEvent::GroupsCreated(vec![name.clone()]));
                        match self.groups.get(&name) {
                            Some(view) => RequestStatus::Created(view.info.clone()),
                            None => RequestStatus::NotAvailable,
                        }
                    }
                    Err(error) => RequestStatus::Error(error),
                }
            }
            _ => RequestStatus::NotImplemented,
        }
    }

    // ---------------------------------------------------------------------
    // Backend notifications
    // ---------------------------------------------------------------------

    fn accepting_notifications(&self, what: &str) -> bool {
        match self.state {
            ListState::Received => true,
            ListState::Waiting => {
                debug!(what, "ignoring roster notification before the list is received");
                false
            }
            ListState::Gone => false,
        }
    }

    /// The backend's cache changed for `changed` and lost `removed`.
    pub fn contacts_changed(
        &mut self,
        ctx: &mut FactoryContext<'_>,
        changed: &[Handle],
        removed: &[Handle],
    ) {
        if !self.accepting_notifications("contacts_changed") {
            return;
        }
        let touched: Vec<Handle> = changed.iter().chain(removed).copied().collect();
        for list in [ListName::Subscribe, ListName::Publish, ListName::Stored] {
            if let Some(change) = self.update_list(list, &touched, ctx.repos_mut().contacts(), false) {
                self.emit_change(change, false);
            }
        }
        if !removed.is_empty() {
            let names: Vec<String> = self.groups.keys().cloned().collect();
            for name in names {
                self.change_group(ctx, &name, &[], removed);
            }
        }
    }

    /// Blocking state changed for `changed`.
    pub fn contact_blocking_changed(&mut self, ctx: &mut FactoryContext<'_>, changed: &[Handle]) {
        if !self.accepting_notifications("contact_blocking_changed") {
            return;
        }
        if let Some(change) = self.update_list(ListName::Deny, changed, ctx.repos_mut().contacts(), false) {
            self.emit_change(change, false);
        }
    }

    pub fn groups_created(&mut self, ctx: &mut FactoryContext<'_>, names: &[String]) {
        if !self.accepting_notifications("groups_created") {
            return;
        }
        let mut created = Vec::new();
        for name in names {
            let Some(name) = self.normalize_group(name) else {
                warn!(group = %name, "ignoring unusable group name");
                continue;
            };
            match self.ensure_group(ctx, &name) {
                Ok(true) => created.push(name),
                Ok(false) => {}
                Err(error) => warn!(group = %name, %error, "cannot create group view"),
            }
        }
        if !created.is_empty() {
            self.events.emit(ContactListEvent::GroupsCreated(created));
        }
    }

    /// Groups vanished. Each first loses all its members, then its channel
    /// closes.
    pub fn groups_removed(&mut self, ctx: &mut FactoryContext<'_>, names: &[String]) {
        if !self.accepting_notifications("groups_removed") {
            return;
        }
        let mut removed = Vec::new();
        for name in names {
            let Some(name) = self.normalize_group(name) else {
                continue;
            };
            let members = self.group_members(&name);
            self.change_group(ctx, &name, &[], &members);
            if self.drop_group(ctx, &name).is_some() {
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            self.events.emit(ContactListEvent::GroupsRemoved(removed));
        }
    }

    /// A group changed its name, keeping its members.
    pub fn group_renamed(&mut self, ctx: &mut FactoryContext<'_>, old: &str, new: &str) {
        if !self.accepting_notifications("group_renamed") {
            return;
        }
        let (Some(old), Some(new)) = (self.normalize_group(old), self.normalize_group(new)) else {
            warn!(old, new, "ignoring rename with an unusable group name");
            return;
        };
        if !self.groups.contains_key(&old) || self.groups.contains_key(&new) {
            warn!(%old, %new, "ignoring rename of unknown group or onto an existing one");
            return;
        }
        if let Err(error) = self.ensure_group(ctx, &new) {
            warn!(%new, %error, "cannot create renamed group view");
            return;
        }
        let Some(mut old_view) = self.groups.remove(&old) else {
            return;
        };
        let members = old_view.members.to_vec();
        if let Some(new_view) = self.groups.get_mut(&new) {
            std::mem::swap(&mut new_view.members, &mut old_view.members);
        }
        if let Ok(repo) = ctx.repos_mut().get_mut(HandleType::Group) {
            let _ = repo.unref_handle(old_view.info.handle);
        }
        ctx.channel_closed(old_view.info.object_path);
        info!(%old, %new, members = members.len(), "group renamed");
        self.events.emit(ContactListEvent::GroupRenamed { old, new, members });
    }

    /// `contacts` joined the `added` groups and left the `removed` ones.
    pub fn groups_changed(
        &mut self,
        ctx: &mut FactoryContext<'_>,
        contacts: &[Handle],
        added: &[String],
        removed: &[String],
    ) {
        if !self.accepting_notifications("groups_changed") {
            return;
        }
        let added: Vec<String> = added.iter().filter_map(|g| self.normalize_group(g)).collect();
        let removed: Vec<String> = removed.iter().filter_map(|g| self.normalize_group(g)).collect();

        let mut created = Vec::new();
        for name in &added {
            match self.ensure_group(ctx, name) {
                Ok(true) => created.push(name.clone()),
                Ok(false) => {}
                Err(error) => warn!(group = %name, %error, "cannot create group view"),
            }
        }
        if !created.is_empty() {
            self.events.emit(ContactListEvent::GroupsCreated(created));
        }
        for name in &added {
            self.change_group(ctx, name, contacts, &[]);
        }
        for name in &removed {
            self.change_group(ctx, name, &[], contacts);
        }
    }

    // ---------------------------------------------------------------------
    // Client operations, forwarded to the backend
    // ---------------------------------------------------------------------

    fn check_alive(&self) -> TpResult<()> {
        if self.state == ListState::Gone {
            Err(TpError::disconnected("contact list is gone"))
        } else {
            Ok(())
        }
    }

    fn subscriptions(&mut self) -> Option<&mut dyn MutableContactList> {
        if self.backend.can_change_subscriptions() {
            self.backend.mutable()
        } else {
            None
        }
    }

    pub fn request_subscription(&mut self, contacts: &[Handle], message: &str) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        let message = if self.backend.request_uses_message() {
            message
        } else {
            ""
        };
        match self.subscriptions() {
            Some(list) => list.request_subscription(contacts, message),
            None => ready(Ok(())),
        }
    }

    pub fn authorize_publication(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.subscriptions() {
            Some(list) => list.authorize_publication(contacts),
            None => ready(Ok(())),
        }
    }

    pub fn unsubscribe(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.subscriptions() {
            Some(list) => list.unsubscribe(contacts),
            None => ready(Ok(())),
        }
    }

    pub fn unpublish(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.subscriptions() {
            Some(list) => list.unpublish(contacts),
            None => ready(Ok(())),
        }
    }

    pub fn store_contacts(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.backend.mutable() {
            Some(list) => list.store_contacts(contacts),
            None => ready(Ok(())),
        }
    }

    pub fn remove_contacts(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.backend.mutable() {
            Some(list) => list.remove_contacts(contacts),
            None => ready(Ok(())),
        }
    }

    fn blocking(&mut self) -> Option<&mut dyn BlockableContactList> {
        self.backend.blockable_mut().filter(|b| b.can_block())
    }

    pub fn block_contacts(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.blocking() {
            Some(list) => list.block_contacts(contacts),
            None => ready(Ok(())),
        }
    }

    pub fn unblock_contacts(&mut self, contacts: &[Handle]) -> ListFuture {
        if let Err(error) = self.check_alive() {
            return ready(Err(error));
        }
        match self.blocking() {
            Some(list) => list.unblock_contacts(contacts),
            None => ready(Ok(())),
        }
    }

    /// Normalized names plus the backend's group editor, if it has one.
    fn group_writer(
        &mut self,
        names: &[&str],
    ) -> TpResult<(Vec<String>, Option<&mut dyn MutableContactGroups>)> {
        self.check_alive()?;
        let normalized = names
            .iter()
            .map(|name| {
                self.normalize_group(name)
                    .ok_or_else(|| TpError::invalid_argument(format!("{name:?} is not a usable group name")))
            })
            .collect::<TpResult<Vec<String>>>()?;
        let writer = self.backend.groups_mut();
        if writer.is_none() {
            debug!(groups = ?normalized, "backend cannot edit groups, ignoring");
        }
        Ok((normalized, writer))
    }

    pub fn create_groups(&mut self, names: &[&str]) -> ListFuture {
        match self.group_writer(names) {
            Ok((names, Some(writer))) => writer.create_groups(&names),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }

    pub fn add_to_group(&mut self, group: &str, contacts: &[Handle]) -> ListFuture {
        match self.group_writer(&[group]) {
            Ok((names, Some(writer))) => writer.add_to_group(&names[0], contacts),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }

    pub fn remove_from_group(&mut self, group: &str, contacts: &[Handle]) -> ListFuture {
        match self.group_writer(&[group]) {
            Ok((names, Some(writer))) => writer.remove_from_group(&names[0], contacts),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }

    pub fn set_group_members(&mut self, group: &str, contacts: &[Handle]) -> ListFuture {
        match self.group_writer(&[group]) {
            Ok((names, Some(writer))) => writer.set_group_members(&names[0], contacts),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }

    pub fn remove_group(&mut self, group: &str) -> ListFuture {
        match self.group_writer(&[group]) {
            Ok((names, Some(writer))) => writer.remove_group(&names[0]),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }

    pub fn rename_group(&mut self, old: &str, new: &str) -> ListFuture {
        match self.group_writer(&[old, new]) {
            Ok((names, Some(writer))) => writer.rename_group(&names[0], &names[1]),
            Ok((_, None)) => ready(Ok(())),
            Err(error) => ready(Err(error)),
        }
    }
}

impl<B: ContactListBackend> ChannelFactory for ContactListManager<B> {
    fn request(
        &mut self,
        request: &ChannelRequest,
        token: RequestToken,
        ctx: &mut FactoryContext<'_>,
    ) -> RequestStatus {
        if request.channel_type != CONTACT_LIST_CHANNEL_TYPE {
            return RequestStatus::NotImplemented;
        }
        match self.state {
            ListState::Gone => RequestStatus::Error(TpError::disconnected("contact list is gone")),
            ListState::Received => self.answer(request, ctx),
            ListState::Waiting => match request.handle_type {
                HandleType::List => match ListName::from_handle(request.handle) {
                    None => RequestStatus::InvalidHandle,
                    Some(list) if !self.has_view(list) => RequestStatus::NotAvailable,
                    Some(_) => {
                        self.queued.push((token, request.clone()));
                        RequestStatus::Queued
                    }
                },
                HandleType::Group => {
                    self.queued.push((token, request.clone()));
                    RequestStatus::Queued
                }
                _ => RequestStatus::NotImplemented,
            },
        }
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.lists
            .values()
            .map(|v| v.info.clone())
            .chain(self.groups.values().map(|g| g.info.clone()))
            .collect()
    }

    fn close_all(&mut self, ctx: &mut FactoryContext<'_>) {
        self.queued.clear();
        for (_, mut view) in std::mem::take(&mut self.lists) {
            view.clear(ctx.repos_mut().contacts());
            ctx.channel_closed(view.info.object_path);
        }
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in names {
            self.drop_group(ctx, &name);
        }
    }

    fn on_disconnected(&mut self, _ctx: &mut FactoryContext<'_>) {
        self.state = ListState::Gone;
    }
}

/// Object path of a list view below `connection`.
pub fn list_channel_path(connection: &ObjectPath, list: ListName) -> TpResult<ObjectPath> {
    connection.child("ContactList")?.child(list.as_str())
}
