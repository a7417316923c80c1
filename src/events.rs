//! The event surface: lifecycle and traffic events fanned out to whoever
//! cares to listen.
use crate::cmd::sms::SmsMessage;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Something observable happened on the transport or the session.
///
/// Delivery is best-effort: events are broadcast without acknowledgment,
/// lagging subscribers lose the oldest events, and nothing here ever blocks
/// the receive pipeline.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// The serial port was opened. Emitted once per successful open.
    PortOpen,
    /// The serial port was closed (explicitly, or because the device went
    /// away). Emitted at most once per open.
    PortClose,
    /// Raw bytes as read from the port, before any normalization.
    RawBytes(Bytes),
    /// An AT command was issued.
    Command(String),
    /// A complete response was collected for an in-flight command.
    Response(String),
    /// An unsolicited notification line arrived while no command was in
    /// flight.
    Notification(String),
    /// A complete (possibly reassembled) SMS message was received.
    Message(SmsMessage),
}

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
    /// Fire-and-forget publish. A send with no subscribers is not an error.
    pub(crate) fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
