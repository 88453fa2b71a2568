//! Listener lists for typed events.
//!
//! A component that emits events owns an [`Emitter`]. Observers call
//! [`Emitter::subscribe`] and receive a [`Subscription`]; dropping the
//! subscription revokes it, and the emitter forgets the listener on the next
//! emission. Delivery goes through unbounded channels so emitting never
//! re-enters the observer.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

/// Fan-out of cloned events to every live subscription.
#[derive(Debug)]
pub struct Emitter<E> {
    listeners: Vec<UnboundedSender<E>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener.
    pub fn subscribe(&mut self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        Subscription { rx }
    }

    /// Delivers `event` to every live listener, pruning revoked ones.
    pub fn emit(&mut self, event: E) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of listeners that have not been revoked yet.
    pub fn listener_count(&mut self) -> usize {
        self.listeners.retain(|tx| !tx.is_closed());
        self.listeners.len()
    }
}

/// Receiving end of an [`Emitter`] registration.
#[derive(Debug)]
pub struct Subscription<E> {
    rx: UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Waits for the next event. Returns `None` once the emitter is gone
    /// and every buffered event has been read.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Takes every event buffered so far.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Revokes the registration explicitly.
    pub fn unsubscribe(mut self) {
        self.rx.close();
    }
}
