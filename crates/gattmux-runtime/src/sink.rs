//! Native event mailbox
//!
//! Transports receive OS callbacks on arbitrary threads. They hand each one
//! to a [`NativeEventSink`], and the service drains the other end on the
//! update context, so the scheduler and the device state machines are only
//! ever touched from one task.

use gattmux_core::NativeEvent;
use tokio::sync::mpsc;
use tracing::trace;

/// Create a connected sink and receiver pair
pub fn channel() -> (NativeEventSink, NativeEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NativeEventSink { tx }, NativeEventReceiver { rx })
}

/// Sending side, cloned into the transport
#[derive(Debug, Clone)]
pub struct NativeEventSink {
    tx: mpsc::UnboundedSender<NativeEvent>,
}

impl NativeEventSink {
    /// Queue an event for the update context.
    ///
    /// Never blocks. Returns `false` once the service has stopped.
    pub fn send(&self, event: NativeEvent) -> bool {
        trace!(?event, "Native event queued");
        self.tx.send(event).is_ok()
    }

    /// Whether the service is still draining events
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side, owned by the service
#[derive(Debug)]
pub struct NativeEventReceiver {
    rx: mpsc::UnboundedReceiver<NativeEvent>,
}

impl NativeEventReceiver {
    /// Next event, `None` once every sink is dropped
    pub async fn recv(&mut self) -> Option<NativeEvent> {
        self.rx.recv().await
    }
}
