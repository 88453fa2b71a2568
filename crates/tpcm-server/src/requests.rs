//! Outstanding channel requests.
//!
//! Every `request_channel` call becomes a [`PendingRequest`] with its own
//! [`RequestToken`] and a one-shot reply. The request stays queued until a
//! factory reports the channel (or an error) for it, and every request gets
//! exactly one reply: taking a request out of the queue is the only way to
//! answer it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tpcm_core::{Handle, HandleType, ObjectPath, TpError, TpResult};
use tracing::{trace, warn};

/// Identifies one channel request for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestToken(u64);

impl RequestToken {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a client asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub channel_type: String,
    pub handle_type: HandleType,
    pub handle: Handle,
    /// The requester will handle the channel itself.
    pub suppress_handler: bool,
}

impl ChannelRequest {
    pub fn new(channel_type: impl Into<String>, handle_type: HandleType, handle: Handle) -> Self {
        Self {
            channel_type: channel_type.into(),
            handle_type,
            handle,
            suppress_handler: false,
        }
    }

    pub fn with_suppress_handler(mut self, suppress: bool) -> Self {
        self.suppress_handler = suppress;
        self
    }
}

/// A channel as the connection and its clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub object_path: ObjectPath,
    pub channel_type: String,
    pub handle_type: HandleType,
    pub handle: Handle,
}

impl ChannelInfo {
    pub fn new(
        object_path: ObjectPath,
        channel_type: impl Into<String>,
        handle_type: HandleType,
        handle: Handle,
    ) -> Self {
        Self {
            object_path,
            channel_type: channel_type.into(),
            handle_type,
            handle,
        }
    }

    /// True if a request for `(type, kind, handle)` would be answered by
    /// this channel.
    pub fn satisfies(&self, request: &ChannelRequest) -> bool {
        self.channel_type == request.channel_type
            && self.handle_type == request.handle_type
            && self.handle == request.handle
    }
}

/// A queued request and the means to answer it.
#[derive(Debug)]
pub struct PendingRequest {
    pub token: RequestToken,
    pub request: ChannelRequest,
    /// Unique bus name of the requester.
    pub sender: String,
    reply: oneshot::Sender<TpResult<ObjectPath>>,
}

impl PendingRequest {
    /// Answers with the channel's path.
    pub fn complete(self, path: &ObjectPath) {
        trace!(token = %self.token, %path, "channel request satisfied");
        if self.reply.send(Ok(path.clone())).is_err() {
            trace!(token = %self.token, "requester went away before the reply");
        }
    }

    pub fn fail(self, error: TpError) {
        trace!(token = %self.token, %error, "channel request failed");
        let _ = self.reply.send(Err(error));
    }
}

/// The requester's side of a channel request.
#[derive(Debug)]
pub struct ChannelReply {
    token: RequestToken,
    rx: oneshot::Receiver<TpResult<ObjectPath>>,
}

impl ChannelReply {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Waits for the reply.
    pub async fn wait(self) -> TpResult<ObjectPath> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(TpError::disconnected("request was dropped unanswered")))
    }

    /// The reply, if it has already arrived.
    pub fn try_result(&mut self) -> Option<TpResult<ObjectPath>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TpError::disconnected(
                "request was dropped unanswered",
            ))),
        }
    }
}

/// The queue of unanswered requests of one connection, oldest first.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Vec<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a request and returns the requester's end of it.
    pub fn enqueue(
        &mut self,
        token: RequestToken,
        request: ChannelRequest,
        sender: impl Into<String>,
    ) -> ChannelReply {
        let (tx, rx) = oneshot::channel();
        self.pending.push(PendingRequest {
            token,
            request,
            sender: sender.into(),
            reply: tx,
        });
        ChannelReply { token, rx }
    }

    pub fn contains(&self, token: RequestToken) -> bool {
        self.pending.iter().any(|p| p.token == token)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes the requests `channel` answers.
    ///
    /// A channel with a target matches every request for the same type,
    /// target kind and handle. A channel without a target (kind `None`)
    /// only matches the request identified by `explicit`.
    pub fn take_matching(
        &mut self,
        channel: &ChannelInfo,
        explicit: Option<RequestToken>,
    ) -> Vec<PendingRequest> {
        let by_target = channel.handle_type != HandleType::None;
        let (matched, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|p| {
                Some(p.token) == explicit || (by_target && channel.satisfies(&p.request))
            });
        self.pending = rest;

        if let Some(token) = explicit {
            if !matched.iter().any(|p| p.token == token) {
                warn!(%token, path = %channel.object_path, "explicit request was not queued");
            }
        }
        matched
    }

    /// Removes one request by token.
    pub fn take(&mut self, token: RequestToken) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|p| p.token == token)?;
        Some(self.pending.remove(index))
    }

    /// Fails every queued request with `error`, returning how many there were.
    pub fn cancel_all(&mut self, error: &TpError) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        for request in pending {
            request.fail(error.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "org.freedesktop.Telepathy.Channel.Type.Text";

    fn path(s: &str) -> ObjectPath {
        ObjectPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn targeted_channels_answer_every_matching_request() {
        let mut queue = RequestQueue::new();
        let bob = Handle::new(7);
        let first = queue.enqueue(
            RequestToken::new(1),
            ChannelRequest::new(TEXT, HandleType::Contact, bob),
            ":1.1",
        );
        let second = queue.enqueue(
            RequestToken::new(2),
            ChannelRequest::new(TEXT, HandleType::Contact, bob),
            ":1.2",
        );
        let other = queue.enqueue(
            RequestToken::new(3),
            ChannelRequest::new(TEXT, HandleType::Contact, Handle::new(8)),
            ":1.1",
        );

        let info = ChannelInfo::new(path("/chan/bob"), TEXT, HandleType::Contact, bob);
        let matched = queue.take_matching(&info, None);
        assert_eq!(matched.len(), 2);
        for request in matched {
            request.complete(&info.object_path);
        }
        assert_eq!(first.wait().await.unwrap(), info.object_path);
        assert_eq!(second.wait().await.unwrap(), info.object_path);
        assert_eq!(queue.len(), 1);
        assert_eq!(other.token(), RequestToken::new(3));
    }

    #[test]
    fn untargeted_channels_only_answer_their_token() {
        let mut queue = RequestQueue::new();
        let request = ChannelRequest::new(TEXT, HandleType::None, Handle::NONE);
        queue.enqueue(RequestToken::new(1), request.clone(), ":1.1");
        queue.enqueue(RequestToken::new(2), request, ":1.1");

        let info = ChannelInfo::new(path("/chan/anon"), TEXT, HandleType::None, Handle::NONE);
        let matched = queue.take_matching(&info, Some(RequestToken::new(2)));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].token, RequestToken::new(2));
        assert!(queue.contains(RequestToken::new(1)));

        assert!(queue.take_matching(&info, None).is_empty());
    }

    #[tokio::test]
    async fn cancel_all_fails_everything_once() {
        let mut queue = RequestQueue::new();
        let mut reply = queue.enqueue(
            RequestToken::new(1),
            ChannelRequest::new(TEXT, HandleType::Contact, Handle::new(1)),
            ":1.1",
        );
        assert!(reply.try_result().is_none());

        let error = TpError::disconnected("gone");
        assert_eq!(queue.cancel_all(&error), 1);
        assert_eq!(queue.cancel_all(&error), 0);
        assert_eq!(reply.try_result(), Some(Err(error)));
    }

    #[tokio::test]
    async fn dropped_requests_report_disconnected() {
        let mut queue = RequestQueue::new();
        let reply = queue.enqueue(
            RequestToken::new(4),
            ChannelRequest::new(TEXT, HandleType::Contact, Handle::new(1)),
            ":1.1",
        );
        drop(queue.take(RequestToken::new(4)));
        assert!(matches!(reply.wait().await, Err(TpError::Disconnected(_))));
    }
}
