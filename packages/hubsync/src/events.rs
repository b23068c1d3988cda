//! Progress events streamed to the caller.
//!
//! The engine publishes, the caller drains: events travel over a bounded
//! flume channel so a slow or absent consumer can never stall a sync flow. An
//! event that cannot be delivered is dropped with a warning rather than
//! blocking the worker that produced it.

use derive_more::Display;
use tracing::warn;

use clients::hub::v1::Item;

/// A progress event emitted by sync flows.
///
/// Error events carry the rendered error message rather than the error value:
/// the originals stay with the flow's outcome accounting, the channel only
/// reports.
#[derive(Clone, Debug, Display)]
pub enum Event {
    #[display("pushed {}", item.label())]
    Pushed { item: Item },
    #[display("push failed for {name}: {error}")]
    PushedError { name: String, error: String },
    #[display("pulled {}", item.label())]
    Pulled { item: Item },
    #[display("pull failed for {id}: {error}")]
    PulledError { id: String, error: String },
    #[display("deleted {}", item.label())]
    Deleted { item: Item },
    #[display("delete failed for {name}: {error}")]
    DeletedError { name: String, error: String },
    #[display("pushed resource {id}")]
    ResourcePushed { id: String },
    #[display("resource push failed for {id}: {error}")]
    ResourcePushedError { id: String, error: String },
    #[display("pulled resource {id}")]
    ResourcePulled { id: String },
    #[display("resource pull failed for {id}: {error}")]
    ResourcePulledError { id: String, error: String },
    #[display("local only: {}", item.label())]
    LocalOnly { item: Item },
    #[display("local only resource: {id}")]
    ResourceLocalOnly { id: String },
}

/// Sending half of the event channel, held by sync flows.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Option<flume::Sender<Event>>,
}

impl EventSink {
    /// Create a bounded channel; the receiver goes to the caller.
    pub fn channel(capacity: usize) -> (Self, flume::Receiver<Event>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that silently discards every event. Used by callers that only
    /// care about the flow outcome.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. Never blocks: a full or disconnected channel drops the
    /// event with a warning.
    pub fn emit(&self, event: Event) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.try_send(event) {
            warn!(dropped = %err.into_inner(), "event channel full or closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, rx) = EventSink::channel(1);
        sink.emit(Event::ResourcePulled { id: "one".into() });
        sink.emit(Event::ResourcePulled { id: "two".into() });

        let received = rx.drain().collect::<Vec<_>>();
        assert_eq!(received.len(), 1);
        assert!(matches!(&received[0], Event::ResourcePulled { id } if id == "one"));
    }

    #[test]
    fn disabled_sink_is_a_no_op() {
        let sink = EventSink::disabled();
        sink.emit(Event::ResourcePulled { id: "one".into() });
    }
}
