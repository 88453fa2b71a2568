//! Fixtures shared by the integration tests: a scripted transport, a text
//! channel factory and an in-memory roster.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tpcm_core::{BoxFuture, Handle, HandleType, TpResult};
use tpcm_server::{
    BlockableContactList, ChannelFactory, ChannelInfo, ChannelReply, ChannelRequest, Connection,
    ContactGroups, ContactListBackend, ContactStates, Context, DynamicRepo, FactoryContext,
    HandleRepos, InMemoryBus, ListFuture, RequestStatus, RequestToken, Transport,
};

pub const TEXT: &str = "org.freedesktop.Telepathy.Channel.Type.Text";

/// Connects as `self_id`, or fails with `error` when set.
pub struct ScriptedTransport {
    pub self_id: String,
    pub error: Option<tpcm_core::TpError>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            error: None,
            log: Arc::default(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> BoxFuture<'_, TpResult<String>> {
        self.log.lock().push("connect".into());
        let result = match self.error.clone() {
            Some(error) => Err(error),
            None => Ok(self.self_id.clone()),
        };
        Box::pin(async move { result })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        self.log.lock().push("transport disconnect".into());
        Box::pin(async {})
    }
}

/// Text channels: contact targets are created on demand, room targets are
/// queued until [`TextFactory::join_rooms`] runs.
#[derive(Default)]
pub struct TextFactory {
    channels: BTreeMap<(HandleType, Handle), ChannelInfo>,
    joining: Vec<(RequestToken, ChannelRequest)>,
    /// Reply whose state is recorded when `close_all` runs.
    pub watched: Arc<Mutex<Option<ChannelReply>>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl TextFactory {
    fn open(&mut self, ctx: &FactoryContext<'_>, kind: HandleType, handle: Handle) -> TpResult<ChannelInfo> {
        let path = ctx.channel_path(&["Text", &format!("{}{}", kind, handle.get())])?;
        let info = ChannelInfo::new(path, TEXT, kind, handle);
        self.channels.insert((kind, handle), info.clone());
        Ok(info)
    }

    /// Completes every pending room join.
    pub fn join_rooms(&mut self, ctx: &mut FactoryContext<'_>) {
        for (token, request) in std::mem::take(&mut self.joining) {
            // the first join's announcement answers later requests for the room
            if self.channels.contains_key(&(request.handle_type, request.handle)) {
                continue;
            }
            match self.open(ctx, request.handle_type, request.handle) {
                Ok(info) => ctx.new_channel(info, Some(token)),
                Err(error) => ctx.channel_error(
                    ChannelInfo::new(ctx.connection_path().clone(), TEXT, request.handle_type, request.handle),
                    error,
                    Some(token),
                ),
            }
        }
    }

    /// A channel nobody asked for, like an incoming message.
    pub fn incoming(&mut self, ctx: &mut FactoryContext<'_>, from: Handle) {
        if let Ok(info) = self.open(ctx, HandleType::Contact, from) {
            ctx.new_channel(info, None);
        }
    }

    pub fn pending_joins(&self) -> usize {
        self.joining.len()
    }
}

impl ChannelFactory for TextFactory {
    fn request(
        &mut self,
        request: &ChannelRequest,
        token: RequestToken,
        ctx: &mut FactoryContext<'_>,
    ) -> RequestStatus {
        if request.channel_type != TEXT {
            return RequestStatus::NotImplemented;
        }
        if let Some(info) = self.channels.get(&(request.handle_type, request.handle)) {
            return RequestStatus::Existing(info.clone());
        }
        match request.handle_type {
            HandleType::Contact => match self.open(ctx, HandleType::Contact, request.handle) {
                Ok(info) => RequestStatus::Created(info),
                Err(error) => RequestStatus::Error(error),
            },
            HandleType::Room => {
                self.joining.push((token, request.clone()));
                RequestStatus::Queued
            }
            _ => RequestStatus::NotAvailable,
        }
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.values().cloned().collect()
    }

    fn close_all(&mut self, ctx: &mut FactoryContext<'_>) {
        if let Some(reply) = self.watched.lock().as_mut() {
            let seen = match reply.try_result() {
                Some(Err(error)) => format!("reply failed: {}", error.kind()),
                Some(Ok(path)) => format!("reply succeeded: {path}"),
                None => "reply pending".to_string(),
            };
            self.log.lock().push(seen);
        }
        self.joining.clear();
        for (_, info) in std::mem::take(&mut self.channels) {
            ctx.channel_closed(info.object_path);
        }
        self.log.lock().push("close_all".into());
    }
}

/// A roster held in memory.
#[derive(Default)]
pub struct MemoryRoster {
    pub contacts: Vec<Handle>,
    pub states: HashMap<Handle, ContactStates>,
    pub groups: BTreeMap<String, Vec<Handle>>,
    pub blocked: Vec<Handle>,
}

impl MemoryRoster {
    pub fn set(&mut self, contact: Handle, states: ContactStates) {
        if !self.contacts.contains(&contact) {
            self.contacts.push(contact);
        }
        self.states.insert(contact, states);
    }

    pub fn forget(&mut self, contact: Handle) {
        self.contacts.retain(|c| *c != contact);
        self.states.remove(&contact);
        for members in self.groups.values_mut() {
            members.retain(|c| *c != contact);
        }
    }
}

impl ContactListBackend for MemoryRoster {
    fn contacts(&self) -> Vec<Handle> {
        self.contacts.clone()
    }

    fn states(&self, contact: Handle) -> Option<ContactStates> {
        self.states.get(&contact).cloned()
    }

    fn blockable(&self) -> Option<&dyn BlockableContactList> {
        Some(self)
    }

    fn groups(&self) -> Option<&dyn ContactGroups> {
        Some(self)
    }
}

impl BlockableContactList for MemoryRoster {
    fn blocked_contacts(&self) -> Vec<Handle> {
        self.blocked.clone()
    }

    fn block_contacts(&mut self, _contacts: &[Handle]) -> ListFuture {
        Box::pin(async { Ok(()) })
    }

    fn unblock_contacts(&mut self, _contacts: &[Handle]) -> ListFuture {
        Box::pin(async { Ok(()) })
    }
}

impl ContactGroups for MemoryRoster {
    fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    fn contact_groups(&self, contact: Handle) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, members)| members.contains(&contact))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// A connection over an in-memory bus with contact, list, group and room
/// repositories, not yet connected.
pub fn connection(transport: ScriptedTransport) -> (Connection, InMemoryBus) {
    let (ctx, bus) = Context::in_memory();
    let repos = HandleRepos::with_contact_lists(DynamicRepo::new(HandleType::Contact))
        .with(DynamicRepo::new(HandleType::Room));
    let conn = Connection::builder(&ctx, "testcm", "test")
        .with_repos(repos)
        .build(transport)
        .expect("connection builds");
    (conn, bus)
}

/// A connected connection with a [`TextFactory`] registered on the bus.
pub async fn connected_with_text() -> (Connection, tpcm_server::FactoryId, InMemoryBus) {
    let (mut conn, bus) = connection(ScriptedTransport::new("me@example.com"));
    let text = conn.add_factory(TextFactory::default());
    conn.register().expect("bus name is free");
    conn.connect().await.expect("scripted connect succeeds");
    (conn, text, bus)
}
