//! Tunnel lifecycle events
//!
//! Events are delivered through a single-consumer queue. The pool is updated
//! before an event is published, so a consumer handling `Created` sees the
//! tunnel in the pool and one handling `Closed` no longer does.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::tunnel::Tunnel;

/// Lifecycle notification for a pooled tunnel
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A tunnel was created and is about to be handed to its first caller
    Created(Arc<Tunnel>),
    /// A tunnel was closed and its resources released
    Closed(Arc<Tunnel>),
}

impl TunnelEvent {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        match self {
            TunnelEvent::Created(tunnel) | TunnelEvent::Closed(tunnel) => tunnel,
        }
    }
}

/// Receives published events. Must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: TunnelEvent);
}

/// Sending half of the event queue
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<TunnelEvent>,
}

/// Receiving half of the event queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<TunnelEvent>,
}

impl EventQueue {
    /// Create a connected queue and receiver
    pub fn channel() -> (EventQueue, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventQueue { tx }, EventReceiver { rx })
    }
}

impl EventSink for EventQueue {
    fn publish(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver gone, dropping tunnel event");
        }
    }
}

impl EventReceiver {
    /// Next event, or `None` once every queue handle is dropped
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<TunnelEvent> {
        self.rx.try_recv().ok()
    }

    /// Dispatch every event to `handler`, one at a time, until the queue closes
    pub async fn dispatch<F>(mut self, mut handler: F)
    where
        F: FnMut(TunnelEvent),
    {
        while let Some(event) = self.rx.recv().await {
            handler(event);
        }
    }
}
