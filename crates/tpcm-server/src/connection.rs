//! One account's connection to a messaging service.
//!
//! A [`Connection`] owns its handle repositories, its channel factories and
//! the queue of unanswered channel requests, and drives them through the
//! status machine
//!
//! ```text
//! NEW -> CONNECTING -> CONNECTED -> DISCONNECTED
//!  \________________________________/^
//! ```
//!
//! The protocol specific work of reaching the service lives behind the
//! [`Transport`] trait.
//!
//! Entering DISCONNECTED runs the shutdown sequence once, in this order:
//! status change announced, queued requests failed with `Disconnected`,
//! factories told and asked to close their channels (only if the
//! connection ever left NEW), self handle released, repositories
//! invalidated, bus name released, `ShutdownFinished` announced.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use tokio::sync::watch;
use tpcm_core::{
    BUS_BASE, BoxFuture, ConnectionStatus, Emitter, Handle, HandleType, ObjectPath, StatusReason,
    Subscription, TpError, TpResult,
};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::factory::{
    ChannelFactory, FactoryContext, FactoryEvent, FactoryId, RequestStatus, downcast_mut,
    downcast_ref,
};
use crate::registrar::{self, BusNames};
use crate::repo::{DynamicRepo, HandleRepos};
use crate::requests::{ChannelInfo, ChannelReply, ChannelRequest, RequestQueue, RequestToken};

/// The protocol specific half of a connection.
pub trait Transport: Send {
    /// Name that identifies the account, used in the connection's bus
    /// name. `None` gets an anonymous name.
    fn unique_name(&self) -> Option<String> {
        None
    }

    /// Reaches the service. Resolves to the local user's identifier.
    fn connect(&mut self) -> BoxFuture<'_, TpResult<String>>;

    /// Tears the session down. Only called if `connect` was attempted.
    fn disconnect(&mut self) -> BoxFuture<'_, ()>;
}

/// Things observers of a connection are told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StatusChanged {
        status: ConnectionStatus,
        reason: StatusReason,
    },
    NewChannel {
        channel: ChannelInfo,
        suppress_handler: bool,
    },
    ChannelClosed {
        object_path: ObjectPath,
    },
    /// The shutdown sequence has completed; emitted exactly once.
    ShutdownFinished,
}

/// Resolves once a connection has finished shutting down.
#[derive(Debug, Clone)]
pub struct DisconnectWaiter {
    rx: watch::Receiver<bool>,
}

impl DisconnectWaiter {
    pub fn is_finished(&self) -> bool {
        *self.rx.borrow()
    }

    /// Also returns if the connection is dropped without shutting down.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|finished| *finished).await;
    }
}

/// Collects what a connection needs before it exists.
pub struct ConnectionBuilder {
    context: Context,
    bus_base: String,
    manager: String,
    protocol: String,
    repos: Option<HandleRepos>,
    interfaces: Vec<String>,
}

impl ConnectionBuilder {
    pub fn with_bus_base(mut self, base: impl Into<String>) -> Self {
        self.bus_base = base.into();
        self
    }

    /// Replaces the default repositories (plain contacts, lists, groups).
    pub fn with_repos(mut self, repos: HandleRepos) -> Self {
        self.repos = Some(repos);
        self
    }

    pub fn with_interfaces<I, S>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = interfaces.into_iter().map(Into::into).collect();
        self
    }

    /// Computes the connection's names and creates it in NEW.
    pub fn build(self, transport: impl Transport + 'static) -> TpResult<Connection> {
        let unique = transport.unique_name();
        let names = registrar::connection_names(
            &self.context,
            &self.bus_base,
            &self.manager,
            &self.protocol,
            unique.as_deref(),
        )?;
        let repos = self.repos.unwrap_or_else(|| {
            HandleRepos::with_contact_lists(DynamicRepo::new(HandleType::Contact))
        });
        let (finished, _) = watch::channel(false);
        debug!(bus_name = %names.bus_name, "created connection");
        Ok(Connection {
            protocol: self.protocol,
            names,
            registered: false,
            context: self.context,
            status: ConnectionStatus::New,
            reason: StatusReason::NoneSpecified,
            self_handle: Handle::NONE,
            interfaces: self.interfaces,
            repos,
            factories: Vec::new(),
            queue: RequestQueue::new(),
            next_token: 1,
            transport: Box::new(transport),
            events: Emitter::new(),
            finished,
        })
    }
}

/// A connection and everything it owns.
pub struct Connection {
    protocol: String,
    names: BusNames,
    registered: bool,
    context: Context,
    status: ConnectionStatus,
    reason: StatusReason,
    self_handle: Handle,
    interfaces: Vec<String>,
    repos: HandleRepos,
    factories: Vec<Box<dyn ChannelFactory>>,
    queue: RequestQueue,
    next_token: u64,
    transport: Box<dyn Transport>,
    events: Emitter<ConnectionEvent>,
    finished: watch::Sender<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("bus_name", &self.names.bus_name)
            .field("status", &self.status)
            .field("self_handle", &self.self_handle)
            .field("factories", &self.factories.len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn builder(
        context: &Context,
        manager: impl Into<String>,
        protocol: impl Into<String>,
    ) -> ConnectionBuilder {
        ConnectionBuilder {
            context: context.clone(),
            bus_base: BUS_BASE.to_string(),
            manager: manager.into(),
            protocol: protocol.into(),
            repos: None,
            interfaces: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Identity and registration
    // ---------------------------------------------------------------------

    pub fn bus_name(&self) -> &str {
        &self.names.bus_name
    }

    pub fn object_path(&self) -> &ObjectPath {
        &self.names.object_path
    }

    pub fn names(&self) -> &BusNames {
        &self.names
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Claims the connection's bus name.
    pub fn register(&mut self) -> TpResult<&BusNames> {
        if self.status == ConnectionStatus::Disconnected {
            return Err(TpError::disconnected("cannot register a disconnected connection"));
        }
        if self.registered {
            return Err(TpError::not_available(format!(
                "{} is already registered",
                self.names.bus_name
            )));
        }
        registrar::claim(&self.context, &self.names)?;
        self.registered = true;
        Ok(&self.names)
    }

    // ---------------------------------------------------------------------
    // Observation
    // ---------------------------------------------------------------------

    pub fn subscribe(&mut self) -> Subscription<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn disconnect_waiter(&self) -> DisconnectWaiter {
        DisconnectWaiter {
            rx: self.finished.subscribe(),
        }
    }

    /// Status as clients see it; NEW reads as DISCONNECTED.
    pub fn status(&self) -> ConnectionStatus {
        self.status.external()
    }

    /// The internal status, NEW included.
    pub fn internal_status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn status_reason(&self) -> StatusReason {
        self.reason
    }

    fn require_connected(&self) -> TpResult<()> {
        if self.status == ConnectionStatus::Connected {
            Ok(())
        } else {
            Err(TpError::not_available(format!(
                "connection is {}, not connected",
                self.status.external()
            )))
        }
    }

    pub fn get_self_handle(&self) -> TpResult<Handle> {
        self.require_connected()?;
        Ok(self.self_handle)
    }

    pub fn get_protocol(&self) -> TpResult<&str> {
        self.require_connected()?;
        Ok(&self.protocol)
    }

    pub fn get_interfaces(&self) -> TpResult<Vec<String>> {
        self.require_connected()?;
        Ok(self.interfaces.clone())
    }

    /// Adds extra interfaces. Only possible before the connection is up.
    pub fn add_interfaces<S: AsRef<str>>(&mut self, interfaces: &[S]) -> TpResult<()> {
        if !matches!(
            self.status,
            ConnectionStatus::New | ConnectionStatus::Connecting
        ) {
            return Err(TpError::not_available(
                "interfaces can only be added before the connection is connected",
            ));
        }
        for interface in interfaces {
            let interface = interface.as_ref();
            if !self.interfaces.iter().any(|i| i == interface) {
                self.interfaces.push(interface.to_string());
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Factories
    // ---------------------------------------------------------------------

    pub fn add_factory<F: ChannelFactory>(&mut self, factory: F) -> FactoryId {
        self.factories.push(Box::new(factory));
        FactoryId(self.factories.len() - 1)
    }

    /// Shared access to a factory of known type.
    pub fn factory<F: ChannelFactory>(&self, id: FactoryId) -> Option<&F> {
        self.factories
            .get(id.0)
            .and_then(|f| downcast_ref::<F>(f.as_ref()))
    }

    /// Runs `call` on a factory with a context, then applies whatever the
    /// factory reported.
    pub fn with_factory<F, R>(
        &mut self,
        id: FactoryId,
        call: impl FnOnce(&mut F, &mut FactoryContext<'_>) -> R,
    ) -> TpResult<R>
    where
        F: ChannelFactory,
    {
        if self.factory::<F>(id).is_none() {
            return Err(TpError::invalid_argument(format!(
                "factory {} is not a {}",
                id.0,
                std::any::type_name::<F>()
            )));
        }
        self.call_factory(id.0, |factory, ctx| downcast_mut::<F>(factory).map(|f| call(f, ctx)))
            .ok_or_else(|| TpError::inconsistent("factory changed type"))
    }

    fn call_factory<R>(
        &mut self,
        index: usize,
        call: impl FnOnce(&mut dyn ChannelFactory, &mut FactoryContext<'_>) -> R,
    ) -> R {
        let mut events = Vec::new();
        let result = {
            let mut ctx = FactoryContext::new(
                &mut self.repos,
                &mut events,
                &self.names.object_path,
                self.self_handle,
                self.status,
            );
            call(self.factories[index].as_mut(), &mut ctx)
        };
        self.apply_factory_events(events);
        result
    }

    fn each_factory(&mut self, hook: impl Fn(&mut dyn ChannelFactory, &mut FactoryContext<'_>)) {
        for index in 0..self.factories.len() {
            self.call_factory(index, |factory, ctx| hook(factory, ctx));
        }
    }

    fn apply_factory_events(&mut self, events: Vec<FactoryEvent>) {
        for event in events {
            match event {
                FactoryEvent::NewChannel { channel, token } => {
                    if self.status == ConnectionStatus::Disconnected {
                        debug!(path = %channel.object_path, "ignoring channel announced during shutdown");
                        continue;
                    }
                    self.announce(&channel, token);
                }
                FactoryEvent::ChannelError {
                    channel,
                    error,
                    token,
                } => {
                    for request in self.queue.take_matching(&channel, token) {
                        request.fail(error.clone());
                    }
                }
                FactoryEvent::ChannelClosed { object_path } => {
                    debug!(path = %object_path, "channel closed");
                    self.events
                        .emit(ConnectionEvent::ChannelClosed { object_path });
                }
            }
        }
    }

    /// Broadcasts a new channel, then answers the requests it satisfies.
    fn announce(&mut self, channel: &ChannelInfo, token: Option<RequestToken>) {
        let satisfied = self.queue.take_matching(channel, token);
        let suppress_handler = satisfied.iter().any(|r| r.request.suppress_handler);
        info!(
            path = %channel.object_path,
            channel_type = %channel.channel_type,
            handle_type = %channel.handle_type,
            handle = %channel.handle,
            requests = satisfied.len(),
            "new channel"
        );
        self.events.emit(ConnectionEvent::NewChannel {
            channel: channel.clone(),
            suppress_handler,
        });
        for request in satisfied {
            request.complete(&channel.object_path);
        }
    }

    // ---------------------------------------------------------------------
    // Channels
    // ---------------------------------------------------------------------

    /// Every open channel of every factory.
    pub fn list_channels(&self) -> TpResult<Vec<ChannelInfo>> {
        self.require_connected()?;
        Ok(self.factories.iter().flat_map(|f| f.channels()).collect())
    }

    /// Asks the factories for a channel.
    ///
    /// Argument and state errors are returned directly. Otherwise the
    /// request is queued and its outcome arrives through the returned
    /// [`ChannelReply`], possibly much later.
    #[tracing::instrument(skip(self, request), fields(
        channel_type = %request.channel_type,
        handle_type = %request.handle_type,
        handle = %request.handle,
    ))]
    pub fn request_channel(
        &mut self,
        request: ChannelRequest,
        sender: &str,
    ) -> TpResult<ChannelReply> {
        self.require_connected()?;
        self.check_target(&request)?;

        let token = RequestToken::new(self.next_token);
        self.next_token += 1;
        let reply = self.queue.enqueue(token, request.clone(), sender);

        let mut refusal: Option<RequestStatus> = None;
        for index in 0..self.factories.len() {
            let status = self.call_factory(index, |factory, ctx| factory.request(&request, token, ctx));
            match status {
                RequestStatus::Existing(channel) => {
                    debug!(%token, path = %channel.object_path, "existing channel");
                    for pending in self.queue.take_matching(&channel, Some(token)) {
                        pending.complete(&channel.object_path);
                    }
                    return Ok(reply);
                }
                RequestStatus::Created(channel) => {
                    if self.queue.contains(token) {
                        self.announce(&channel, Some(token));
                    }
                    return Ok(reply);
                }
                RequestStatus::Queued => {
                    debug!(%token, "request queued by factory");
                    return Ok(reply);
                }
                RequestStatus::Error(error) => {
                    if let Some(pending) = self.queue.take(token) {
                        pending.fail(error);
                    }
                    return Ok(reply);
                }
                declined => {
                    if refusal
                        .as_ref()
                        .is_none_or(|best| declined.refusal_rank() > best.refusal_rank())
                    {
                        refusal = Some(declined);
                    }
                }
            }
        }

        let error = refusal
            .unwrap_or(RequestStatus::NotImplemented)
            .into_error();
        debug!(%token, %error, "no factory accepted the request");
        if let Some(pending) = self.queue.take(token) {
            pending.fail(error);
        }
        Ok(reply)
    }

    fn check_target(&self, request: &ChannelRequest) -> TpResult<()> {
        if request.handle_type == HandleType::None {
            if request.handle.is_none() {
                return Ok(());
            }
            return Err(TpError::invalid_argument(
                "a channel without a target must use handle 0",
            ));
        }
        self.repos
            .get(request.handle_type)?
            .validate(&[request.handle], false)
    }

    /// Number of requests still waiting for an answer.
    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    // ---------------------------------------------------------------------
    // Handles
    // ---------------------------------------------------------------------

    /// Direct access to the repositories, for protocol code.
    pub fn repos(&self) -> &HandleRepos {
        &self.repos
    }

    pub fn repos_mut(&mut self) -> &mut HandleRepos {
        &mut self.repos
    }

    /// Holds every handle for `client`, or none of them.
    pub fn hold_handles(
        &mut self,
        kind: HandleType,
        handles: &[Handle],
        client: &str,
    ) -> TpResult<()> {
        self.require_connected()?;
        let repo = self.repos.get_mut(kind)?;
        repo.validate(handles, false)?;
        for (i, &handle) in handles.iter().enumerate() {
            if let Err(error) = repo.client_hold(handle, client) {
                for &held in &handles[..i] {
                    let _ = repo.client_release(held, client);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Releases every handle for `client`, or none of them.
    pub fn release_handles(
        &mut self,
        kind: HandleType,
        handles: &[Handle],
        client: &str,
    ) -> TpResult<()> {
        self.require_connected()?;
        let repo = self.repos.get_mut(kind)?;
        repo.validate(handles, false)?;

        let mut wanted: HashMap<Handle, u32> = HashMap::new();
        for &handle in handles {
            *wanted.entry(handle).or_insert(0) += 1;
        }
        for (&handle, &count) in &wanted {
            if repo.client_holds(handle, client) < count {
                return Err(TpError::not_yours(format!(
                    "{client} does not hold {kind} handle {handle}"
                )));
            }
        }
        for &handle in handles {
            repo.client_release(handle, client)?;
        }
        Ok(())
    }

    /// Identifiers of `handles`, all valid or an error.
    pub fn inspect_handles(&self, kind: HandleType, handles: &[Handle]) -> TpResult<Vec<String>> {
        self.require_connected()?;
        let repo = self.repos.get(kind)?;
        repo.validate(handles, false)?;
        handles.iter().map(|&h| repo.inspect(h)).collect()
    }

    /// Interns `ids` and holds the handles for `client`.
    pub fn request_handles<S: AsRef<str>>(
        &mut self,
        kind: HandleType,
        ids: &[S],
        client: &str,
    ) -> TpResult<Vec<Handle>> {
        self.require_connected()?;
        let repo = self.repos.get_mut(kind)?;
        let mut interned = Vec::with_capacity(ids.len());
        for id in ids {
            match repo.intern(id.as_ref()) {
                Ok(handle) => interned.push(handle),
                Err(error) => {
                    for handle in interned {
                        let _ = repo.unref_handle(handle);
                    }
                    return Err(error);
                }
            }
        }
        for &handle in &interned {
            repo.client_hold(handle, client)?;
        }
        for &handle in &interned {
            repo.unref_handle(handle)?;
        }
        Ok(interned)
    }

    /// Drops every hold of a bus client that went away.
    pub fn client_vanished(&mut self, client: &str) {
        if self.status == ConnectionStatus::Disconnected {
            return;
        }
        self.repos.client_vanished(client);
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    fn change_status(&mut self, status: ConnectionStatus, reason: StatusReason) {
        if status == self.status {
            warn!(%status, "ignoring change to the current status");
            return;
        }
        info!(bus_name = %self.names.bus_name, from = %self.status, to = %status, ?reason, "status changed");
        self.status = status;
        self.reason = reason;
        self.events.emit(ConnectionEvent::StatusChanged {
            status: status.external(),
            reason,
        });
        match status {
            ConnectionStatus::Connecting => self.each_factory(|f, ctx| f.on_connecting(ctx)),
            ConnectionStatus::Connected => self.each_factory(|f, ctx| f.on_connected(ctx)),
            ConnectionStatus::Disconnected | ConnectionStatus::New => {}
        }
    }

    /// Connects through the transport.
    ///
    /// Calling this while connecting or connected does nothing. A failed
    /// attempt runs the shutdown sequence with a reason derived from the
    /// error, and returns the error.
    #[tracing::instrument(skip(self), fields(bus_name = %self.names.bus_name))]
    pub async fn connect(&mut self) -> TpResult<()> {
        match self.status {
            ConnectionStatus::New => {}
            ConnectionStatus::Connecting | ConnectionStatus::Connected => return Ok(()),
            ConnectionStatus::Disconnected => {
                return Err(TpError::disconnected("connection has already been disconnected"));
            }
        }

        self.change_status(ConnectionStatus::Connecting, StatusReason::Requested);
        let self_id = match self.transport.connect().await {
            Ok(id) => id,
            Err(error) => {
                warn!(%error, "connection attempt failed");
                self.shutdown(error.status_reason()).await;
                return Err(error);
            }
        };
        match self.repos.contacts().intern(&self_id) {
            Ok(handle) => self.self_handle = handle,
            Err(error) => {
                warn!(%error, id = %self_id, "transport reported an unusable self identifier");
                self.shutdown(StatusReason::NoneSpecified).await;
                return Err(error);
            }
        }
        self.change_status(ConnectionStatus::Connected, StatusReason::Requested);
        Ok(())
    }

    /// Disconnects at the user's request. Idempotent.
    pub async fn disconnect(&mut self) {
        self.shutdown(StatusReason::Requested).await;
    }

    /// Disconnects because the session failed.
    pub async fn connection_lost(&mut self, error: &TpError) {
        warn!(bus_name = %self.names.bus_name, %error, "connection lost");
        self.shutdown(error.status_reason()).await;
    }

    async fn shutdown(&mut self, reason: StatusReason) {
        if self.status == ConnectionStatus::Disconnected {
            debug!(bus_name = %self.names.bus_name, "already disconnected");
            return;
        }
        let previous = self.status;
        info!(bus_name = %self.names.bus_name, from = %previous, ?reason, "disconnecting");
        self.status = ConnectionStatus::Disconnected;
        self.reason = reason;
        self.events.emit(ConnectionEvent::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason,
        });

        let cancelled = self
            .queue
            .cancel_all(&TpError::disconnected("connection was disconnected"));
        if cancelled > 0 {
            debug!(cancelled, "failed queued channel requests");
        }

        if previous != ConnectionStatus::New {
            self.each_factory(|f, ctx| f.on_disconnected(ctx));
            self.each_factory(|f, ctx| f.close_all(ctx));
            self.transport.disconnect().await;
        }

        if !self.self_handle.is_none() {
            let _ = self.repos.contacts().unref_handle(self.self_handle);
            self.self_handle = Handle::NONE;
        }
        self.repos.invalidate_all();

        if self.registered {
            registrar::release(&self.context, &self.names);
            self.registered = false;
        }

        self.events.emit(ConnectionEvent::ShutdownFinished);
        self.finished.send_replace(true);
        debug!(bus_name = %self.names.bus_name, "shutdown finished");
    }

    /// Connects if needed and returns a view that is known to be up.
    pub async fn prepare(&mut self) -> TpResult<ReadyConnection<'_>> {
        if self.status == ConnectionStatus::New {
            self.connect().await?;
        }
        match self.status {
            ConnectionStatus::Connected => Ok(ReadyConnection { conn: self }),
            ConnectionStatus::Disconnected => {
                Err(TpError::disconnected("connection has been disconnected"))
            }
            other => Err(TpError::not_available(format!("connection is {other}"))),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.registered {
            registrar::release(&self.context, &self.names);
        }
    }
}

/// A connection that was connected when the view was taken.
#[derive(Debug)]
pub struct ReadyConnection<'a> {
    conn: &'a mut Connection,
}

impl ReadyConnection<'_> {
    pub fn self_handle(&self) -> Handle {
        self.conn.self_handle
    }

    /// The local user's identifier.
    pub fn self_id(&self) -> TpResult<String> {
        self.conn.repos.get(HandleType::Contact)?.inspect(self.conn.self_handle)
    }

    pub fn protocol(&self) -> &str {
        &self.conn.protocol
    }
}

impl Deref for ReadyConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for ReadyConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryBus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TEXT: &str = "org.freedesktop.Telepathy.Channel.Type.Text";

    struct FakeTransport {
        account: Option<String>,
        outcome: TpResult<String>,
        disconnects: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        fn ok(id: &str) -> Self {
            Self {
                account: Some(id.to_string()),
                outcome: Ok(id.to_string()),
                disconnects: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Transport for FakeTransport {
        fn unique_name(&self) -> Option<String> {
            self.account.clone()
        }

        fn connect(&mut self) -> BoxFuture<'_, TpResult<String>> {
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }

        fn disconnect(&mut self) -> BoxFuture<'_, ()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    /// Answers Text requests: Created the first time, Existing afterwards.
    #[derive(Default)]
    struct Texts {
        open: Vec<ChannelInfo>,
        hooks: Vec<&'static str>,
    }

    impl ChannelFactory for Texts {
        fn request(
            &mut self,
            request: &ChannelRequest,
            token: RequestToken,
            ctx: &mut FactoryContext<'_>,
        ) -> RequestStatus {
            if request.channel_type != TEXT {
                return RequestStatus::NotImplemented;
            }
            if request.handle_type != HandleType::Contact {
                return RequestStatus::NotAvailable;
            }
            if let Some(open) = self.open.iter().find(|c| c.satisfies(request)) {
                return RequestStatus::Existing(open.clone());
            }
            let path = match ctx.channel_path(&["text", &request.handle.to_string()]) {
                Ok(path) => path,
                Err(error) => return RequestStatus::Error(error),
            };
            let info = ChannelInfo::new(path, TEXT, HandleType::Contact, request.handle);
            self.open.push(info.clone());
            ctx.new_channel(info.clone(), Some(token));
            RequestStatus::Created(info)
        }

        fn channels(&self) -> Vec<ChannelInfo> {
            self.open.clone()
        }

        fn close_all(&mut self, ctx: &mut FactoryContext<'_>) {
            self.hooks.push("close_all");
            for channel in self.open.drain(..) {
                ctx.channel_closed(channel.object_path);
            }
        }

        fn on_connecting(&mut self, _ctx: &mut FactoryContext<'_>) {
            self.hooks.push("connecting");
        }

        fn on_connected(&mut self, _ctx: &mut FactoryContext<'_>) {
            self.hooks.push("connected");
        }

        fn on_disconnected(&mut self, _ctx: &mut FactoryContext<'_>) {
            self.hooks.push("disconnected");
        }
    }

    fn setup(transport: FakeTransport) -> (Connection, InMemoryBus) {
        let (ctx, bus) = Context::in_memory();
        let conn = Connection::builder(&ctx, "example", "local-xmpp")
            .build(transport)
            .unwrap();
        (conn, bus)
    }

    #[tokio::test]
    async fn connect_walks_the_status_machine() {
        let (mut conn, bus) = setup(FakeTransport::ok("me@example.com"));
        let texts = conn.add_factory(Texts::default());
        let mut events = conn.subscribe();
        conn.register().unwrap();
        assert_eq!(bus.owned_names(), vec![conn.bus_name().to_string()]);

        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(conn.get_self_handle().is_err());
        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);
        assert_eq!(conn.get_protocol().unwrap(), "local-xmpp");
        let me = conn.get_self_handle().unwrap();
        assert_eq!(
            conn.inspect_handles(HandleType::Contact, &[me]).unwrap(),
            vec!["me@example.com".to_string()]
        );

        let statuses: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ConnectionEvent::StatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(
            conn.factory::<Texts>(texts).unwrap().hooks,
            vec!["connecting", "connected"]
        );
        // a second connect is a no-op
        conn.connect().await.unwrap();
    }

    #[tokio::test]
    async fn failed_connect_disconnects_with_the_error_reason() {
        let mut transport = FakeTransport::ok("me");
        transport.outcome = Err(TpError::authentication("bad password"));
        let disconnects = transport.disconnects.clone();
        let (mut conn, _bus) = setup(transport);
        let waiter = conn.disconnect_waiter();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, TpError::AuthenticationFailed(_)));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.status_reason(), StatusReason::AuthenticationFailed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(waiter.is_finished());
        assert!(matches!(
            conn.connect().await,
            Err(TpError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn interfaces_freeze_once_connected() {
        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        conn.add_interfaces(&["org.example.Presence", "org.example.Presence"])
            .unwrap();
        conn.connect().await.unwrap();
        assert_eq!(
            conn.get_interfaces().unwrap(),
            vec!["org.example.Presence".to_string()]
        );
        assert!(matches!(
            conn.add_interfaces(&["org.example.Late"]),
            Err(TpError::NotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn requests_are_created_then_existing() {
        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        conn.add_factory(Texts::default());
        let mut events = conn.subscribe();
        conn.connect().await.unwrap();
        events.drain();

        let bob = conn
            .request_handles(HandleType::Contact, &["bob"], ":1.5")
            .unwrap()[0];
        let request = ChannelRequest::new(TEXT, HandleType::Contact, bob);
        let first = conn.request_channel(request.clone(), ":1.5").unwrap();
        let path = first.wait().await.unwrap();

        let announced: Vec<_> = events.drain();
        assert_eq!(announced.len(), 1);
        assert!(matches!(
            &announced[0],
            ConnectionEvent::NewChannel { channel, suppress_handler: false } if channel.object_path == path
        ));

        let second = conn.request_channel(request, ":1.5").unwrap();
        assert_eq!(second.wait().await.unwrap(), path);
        assert!(events.drain().is_empty(), "existing channels are not re-announced");
        assert_eq!(conn.list_channels().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn declined_requests_report_the_best_refusal() {
        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        conn.add_factory(Texts::default());
        conn.connect().await.unwrap();

        let unknown = conn
            .request_channel(
                ChannelRequest::new("org.example.Unknown", HandleType::None, Handle::NONE),
                ":1.5",
            )
            .unwrap();
        assert!(matches!(
            unknown.wait().await,
            Err(TpError::NotImplemented(_))
        ));

        let list = conn
            .request_channel(
                ChannelRequest::new(TEXT, HandleType::List, Handle::new(1)),
                ":1.5",
            )
            .unwrap();
        assert!(matches!(list.wait().await, Err(TpError::NotAvailable(_))));

        assert!(matches!(
            conn.request_channel(
                ChannelRequest::new(TEXT, HandleType::Contact, Handle::new(99)),
                ":1.5"
            ),
            Err(TpError::InvalidHandle(_))
        ));
        assert!(matches!(
            conn.request_channel(
                ChannelRequest::new(TEXT, HandleType::None, Handle::new(3)),
                ":1.5"
            ),
            Err(TpError::InvalidArgument(_))
        ));
        assert_eq!(conn.queued_requests(), 0);
    }

    #[tokio::test]
    async fn handle_holds_are_all_or_nothing() {
        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        conn.connect().await.unwrap();
        let handles = conn
            .request_handles(HandleType::Contact, &["a", "b"], ":1.5")
            .unwrap();

        // releasing one handle twice fails without releasing anything
        assert!(matches!(
            conn.release_handles(HandleType::Contact, &[handles[0], handles[0]], ":1.5"),
            Err(TpError::NotYours(_))
        ));
        assert!(conn.repos().get(HandleType::Contact).unwrap().is_valid(handles[0]));

        assert!(matches!(
            conn.hold_handles(HandleType::Contact, &[handles[1], Handle::new(77)], ":1.6"),
            Err(TpError::InvalidHandle(_))
        ));
        assert_eq!(
            conn.repos()
                .get(HandleType::Contact)
                .unwrap()
                .client_holds(handles[1], ":1.6"),
            0
        );

        conn.release_handles(HandleType::Contact, &handles, ":1.5")
            .unwrap();
        assert!(!conn.repos().get(HandleType::Contact).unwrap().is_valid(handles[0]));
    }

    #[tokio::test]
    async fn vanished_clients_release_their_handles() {
        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        conn.connect().await.unwrap();
        let handles = conn
            .request_handles(HandleType::Contact, &["a"], ":1.9")
            .unwrap();
        conn.client_vanished(":1.9");
        assert!(conn.inspect_handles(HandleType::Contact, &handles).is_err());
    }

    #[tokio::test]
    async fn disconnect_runs_the_shutdown_sequence_once() {
        let transport = FakeTransport::ok("me");
        let disconnects = transport.disconnects.clone();
        let (mut conn, bus) = setup(transport);
        let texts = conn.add_factory(Texts::default());
        conn.register().unwrap();
        conn.connect().await.unwrap();
        let bob = conn
            .request_handles(HandleType::Contact, &["bob"], ":1.5")
            .unwrap()[0];
        conn.request_channel(ChannelRequest::new(TEXT, HandleType::Contact, bob), ":1.5")
            .unwrap();
        let mut events = conn.subscribe();

        conn.disconnect().await;
        conn.disconnect().await;

        let events = events.drain();
        assert!(matches!(
            events.first(),
            Some(ConnectionEvent::StatusChanged {
                status: ConnectionStatus::Disconnected,
                reason: StatusReason::Requested
            })
        ));
        assert!(matches!(events[1], ConnectionEvent::ChannelClosed { .. }));
        assert_eq!(events.last(), Some(&ConnectionEvent::ShutdownFinished));
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == ConnectionEvent::ShutdownFinished)
                .count(),
            1
        );
        assert_eq!(
            conn.factory::<Texts>(texts).unwrap().hooks,
            vec!["connecting", "connected", "disconnected", "close_all"]
        );
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(bus.owned_names().is_empty());
        assert!(matches!(
            conn.repos().get(HandleType::Contact).unwrap().inspect(bob),
            Err(TpError::Disconnected(_))
        ));
        assert!(conn.disconnect_waiter().is_finished());
    }

    #[tokio::test]
    async fn disconnecting_a_new_connection_skips_the_transport() {
        let transport = FakeTransport::ok("me");
        let disconnects = transport.disconnects.clone();
        let (mut conn, _bus) = setup(transport);
        let texts = conn.add_factory(Texts::default());
        let waiter = conn.disconnect_waiter();

        conn.disconnect().await;
        waiter.wait().await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);
        assert!(conn.factory::<Texts>(texts).unwrap().hooks.is_empty());
    }

    #[tokio::test]
    async fn prepare_connects_on_demand() {
        let (mut conn, _bus) = setup(FakeTransport::ok("Me"));
        let ready = conn.prepare().await.unwrap();
        assert_eq!(ready.self_id().unwrap(), "Me");
        assert_eq!(ready.protocol(), "local-xmpp");
        assert!(!ready.self_handle().is_none());
        drop(ready);

        conn.disconnect().await;
        assert!(matches!(
            conn.prepare().await,
            Err(TpError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn bus_names_collide_per_account() {
        let (ctx, _bus) = Context::in_memory();
        let mut first = Connection::builder(&ctx, "example", "irc")
            .build(FakeTransport::ok("nick"))
            .unwrap();
        let mut second = Connection::builder(&ctx, "example", "irc")
            .build(FakeTransport::ok("nick"))
            .unwrap();
        first.register().unwrap();
        assert!(matches!(second.register(), Err(TpError::NotAvailable(_))));
        drop(first);
        second.register().unwrap();
    }

    #[test]
    fn wrong_factory_type_is_rejected() {
        struct Other;
        impl ChannelFactory for Other {
            fn request(
                &mut self,
                _: &ChannelRequest,
                _: RequestToken,
                _: &mut FactoryContext<'_>,
            ) -> RequestStatus {
                RequestStatus::NotImplemented
            }
            fn channels(&self) -> Vec<ChannelInfo> {
                Vec::new()
            }
            fn close_all(&mut self, _: &mut FactoryContext<'_>) {}
        }

        let (mut conn, _bus) = setup(FakeTransport::ok("me"));
        let id = conn.add_factory(Other);
        assert!(conn.with_factory::<Texts, _>(id, |_, _| ()).is_err());
        assert!(conn.with_factory::<Other, _>(id, |_, _| ()).is_ok());
    }
}
