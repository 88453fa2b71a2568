//! Channel factories.
//!
//! A connection owns a list of [`ChannelFactory`] values and asks each in
//! turn to satisfy a channel request. Factories never call back into the
//! connection; they report channels through the [`FactoryContext`] they are
//! handed, and the connection acts on those reports once the factory call
//! returns.

use std::any::Any;

use tpcm_core::{ConnectionStatus, Handle, ObjectPath, TpError, TpResult, escape_as_identifier};

use crate::repo::HandleRepos;
use crate::requests::{ChannelInfo, ChannelRequest, RequestToken};

/// How a factory answered a channel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    /// The factory does not make channels of this type.
    NotImplemented,
    /// It does, but not right now (wrong state, unsupported target).
    NotAvailable,
    /// It does, but rejects the target handle.
    InvalidHandle,
    /// An open channel already satisfies the request.
    Existing(ChannelInfo),
    /// A channel was created for the request. The factory may report it
    /// through [`FactoryContext::new_channel`]; if it does not, the
    /// connection announces it.
    Created(ChannelInfo),
    /// The factory took responsibility and will report the outcome with
    /// the request's token later.
    Queued,
    /// The request failed.
    Error(TpError),
}

impl RequestStatus {
    /// Rank among the "not mine" answers. When every factory declines,
    /// the highest ranked refusal is reported.
    pub fn refusal_rank(&self) -> Option<u8> {
        match self {
            Self::NotImplemented => Some(0),
            Self::NotAvailable => Some(1),
            Self::InvalidHandle => Some(2),
            _ => None,
        }
    }

    /// The error a client sees for a refusal.
    pub fn into_error(self) -> TpError {
        match self {
            Self::NotImplemented => {
                TpError::not_implemented("no factory can make channels of this type")
            }
            Self::NotAvailable => TpError::not_available("channel is not available"),
            Self::InvalidHandle => TpError::invalid_handle("channel target was rejected"),
            Self::Error(error) => error,
            Self::Existing(_) | Self::Created(_) | Self::Queued => {
                TpError::inconsistent("request was not refused")
            }
        }
    }
}

/// A report from a factory, applied by the connection after the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryEvent {
    NewChannel {
        channel: ChannelInfo,
        token: Option<RequestToken>,
    },
    ChannelError {
        channel: ChannelInfo,
        error: TpError,
        token: Option<RequestToken>,
    },
    ChannelClosed {
        object_path: ObjectPath,
    },
}

/// What a factory sees of its connection during one call.
pub struct FactoryContext<'a> {
    repos: &'a mut HandleRepos,
    events: &'a mut Vec<FactoryEvent>,
    connection_path: &'a ObjectPath,
    self_handle: Handle,
    status: ConnectionStatus,
}

impl<'a> FactoryContext<'a> {
    pub(crate) fn new(
        repos: &'a mut HandleRepos,
        events: &'a mut Vec<FactoryEvent>,
        connection_path: &'a ObjectPath,
        self_handle: Handle,
        status: ConnectionStatus,
    ) -> Self {
        Self {
            repos,
            events,
            connection_path,
            self_handle,
            status,
        }
    }

    pub fn repos(&self) -> &HandleRepos {
        &*self.repos
    }

    pub fn repos_mut(&mut self) -> &mut HandleRepos {
        &mut *self.repos
    }

    /// The local user's contact handle, `0` until connected.
    pub fn self_handle(&self) -> Handle {
        self.self_handle
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn connection_path(&self) -> &ObjectPath {
        self.connection_path
    }

    /// Object path for a channel below the connection; each element is
    /// escaped.
    pub fn channel_path(&self, elements: &[&str]) -> TpResult<ObjectPath> {
        elements
            .iter()
            .try_fold(self.connection_path.clone(), |path, element| {
                path.child(&escape_as_identifier(element))
            })
    }

    /// Announces a channel. With `token`, the request it answers; without,
    /// every queued request for the same target.
    pub fn new_channel(&mut self, channel: ChannelInfo, token: Option<RequestToken>) {
        self.events.push(FactoryEvent::NewChannel { channel, token });
    }

    /// Fails the request(s) waiting for `channel`.
    pub fn channel_error(
        &mut self,
        channel: ChannelInfo,
        error: TpError,
        token: Option<RequestToken>,
    ) {
        self.events.push(FactoryEvent::ChannelError {
            channel,
            error,
            token,
        });
    }

    pub fn channel_closed(&mut self, object_path: ObjectPath) {
        self.events.push(FactoryEvent::ChannelClosed { object_path });
    }
}

/// Access to the concrete type behind a `dyn ChannelFactory`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Something that creates and tracks channels of some kind.
pub trait ChannelFactory: AsAny + Send {
    /// Answers a channel request. `token` identifies the request in later
    /// reports.
    fn request(
        &mut self,
        request: &ChannelRequest,
        token: RequestToken,
        ctx: &mut FactoryContext<'_>,
    ) -> RequestStatus;

    /// Every open channel.
    fn channels(&self) -> Vec<ChannelInfo>;

    /// Closes every channel, reporting each closure.
    fn close_all(&mut self, ctx: &mut FactoryContext<'_>);

    fn on_connecting(&mut self, _ctx: &mut FactoryContext<'_>) {}

    fn on_connected(&mut self, _ctx: &mut FactoryContext<'_>) {}

    fn on_disconnected(&mut self, _ctx: &mut FactoryContext<'_>) {}
}

/// Position of a factory in its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryId(pub(crate) usize);

pub(crate) fn downcast_ref<F: ChannelFactory>(factory: &dyn ChannelFactory) -> Option<&F> {
    AsAny::as_any(factory).downcast_ref::<F>()
}

pub(crate) fn downcast_mut<F: ChannelFactory>(factory: &mut dyn ChannelFactory) -> Option<&mut F> {
    AsAny::as_any_mut(factory).downcast_mut::<F>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::DynamicRepo;
    use tpcm_core::HandleType;

    struct Nothing;

    impl ChannelFactory for Nothing {
        fn request(
            &mut self,
            _request: &ChannelRequest,
            _token: RequestToken,
            _ctx: &mut FactoryContext<'_>,
        ) -> RequestStatus {
            RequestStatus::NotImplemented
        }

        fn channels(&self) -> Vec<ChannelInfo> {
            Vec::new()
        }

        fn close_all(&mut self, _ctx: &mut FactoryContext<'_>) {}
    }

    #[test]
    fn refusals_rank_invalid_handle_highest() {
        let mut refusals = [
            RequestStatus::InvalidHandle,
            RequestStatus::NotImplemented,
            RequestStatus::NotAvailable,
        ];
        refusals.sort_by_key(|s| s.refusal_rank());
        assert_eq!(refusals[2], RequestStatus::InvalidHandle);
        assert_eq!(RequestStatus::Queued.refusal_rank(), None);
        assert!(matches!(
            RequestStatus::NotAvailable.into_error(),
            TpError::NotAvailable(_)
        ));
    }

    #[test]
    fn context_collects_reports_in_order() {
        let mut repos = HandleRepos::new(DynamicRepo::new(HandleType::Contact));
        let mut events = Vec::new();
        let conn = ObjectPath::new("/org/freedesktop/Telepathy/Connection/cm/x/_0").unwrap();
        let mut ctx = FactoryContext::new(
            &mut repos,
            &mut events,
            &conn,
            Handle::NONE,
            ConnectionStatus::Connected,
        );
        let path = ctx.channel_path(&["Text", "bob@example.com"]).unwrap();
        assert_eq!(
            path.as_str(),
            "/org/freedesktop/Telepathy/Connection/cm/x/_0/Text/bob_40example_2ecom"
        );
        let info = ChannelInfo::new(path.clone(), "t", HandleType::Contact, Handle::new(1));
        ctx.new_channel(info.clone(), Some(RequestToken::new(1)));
        ctx.channel_closed(path.clone());

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            FactoryEvent::NewChannel {
                channel: info,
                token: Some(RequestToken::new(1))
            }
        );
        assert_eq!(events[1], FactoryEvent::ChannelClosed { object_path: path });
    }

    #[test]
    fn downcasting_recovers_the_concrete_factory() {
        let mut boxed: Box<dyn ChannelFactory> = Box::new(Nothing);
        assert!(downcast_mut::<Nothing>(boxed.as_mut()).is_some());
        assert!(downcast_ref::<Nothing>(boxed.as_ref()).is_some());
    }
}
