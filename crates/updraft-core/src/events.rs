use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::{MetadataError, ReleaseError};
use crate::release::ReleaseState;

/// Notification delivered to the host.
///
/// All events of a feed travel through one channel, so the host observes
/// them one at a time and in the order they were produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    StateChanged {
        version: String,
        state: ReleaseState,
    },
    StageFailed {
        version: Option<String>,
        error: ReleaseError,
    },
    CheckFailed(MetadataError),
    /// A verified release is waiting for [`crate::Feed::install_now`].
    ReadyToInstall {
        version: String,
    },
}

/// Receiving end of a feed's event channel.
#[derive(Debug)]
pub struct FeedEvents {
    rx: mpsc::UnboundedReceiver<FeedEvent>,
}

impl FeedEvents {
    /// Wait for the next event. Returns `None` once the feed is dropped and
    /// every pending event was received.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<FeedEvent>,
    delivering: Arc<AtomicBool>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, FeedEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                delivering: Arc::new(AtomicBool::new(true)),
            },
            FeedEvents { rx },
        )
    }

    pub(crate) fn emit(&self, event: FeedEvent) {
        if self.delivering.load(Ordering::Acquire) {
            // The host dropping its receiver only means nobody listens.
            let _ = self.tx.send(event);
        }
    }

    pub(crate) fn set_delivering(&self, delivering: bool) {
        self.delivering.store(delivering, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{EventSink, FeedEvent};
    use crate::release::ReleaseState;

    fn changed(version: &str) -> FeedEvent {
        FeedEvent::StateChanged {
            version: version.to_string(),
            state: ReleaseState::Fetched,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let (sink, mut events) = EventSink::channel();
        sink.emit(changed("1.0.0"));
        sink.emit(changed("1.0.1"));

        assert_eq!(events.recv().await, Some(changed("1.0.0")));
        assert_eq!(events.recv().await, Some(changed("1.0.1")));
    }

    #[test]
    fn paused_sink_drops_events() {
        let (sink, mut events) = EventSink::channel();
        sink.set_delivering(false);
        sink.emit(changed("1.0.0"));
        sink.set_delivering(true);
        sink.emit(changed("1.0.1"));

        assert_eq!(events.try_recv(), Some(changed("1.0.1")));
        assert_eq!(events.try_recv(), None);
    }
}
