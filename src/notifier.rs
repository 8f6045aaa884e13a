use crate::result::TargetResult;
use crate::target::Target;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Progress event emitted while dispatching an action
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// About to invoke the transport for a target
    NodeStart { target: Target },
    /// The transport returned for a target
    NodeResult { result: TargetResult },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } => "node_start",
            Self::NodeResult { .. } => "node_result",
        }
    }

    /// Target the event is about
    #[must_use]
    pub fn target(&self) -> &Target {
        match self {
            Self::NodeStart { target } => target,
            Self::NodeResult { result } => result.target(),
        }
    }
}

/// Observer invoked once per event
pub type Callback = Arc<dyn Fn(Event) + Send + Sync>;

/// Delivers events to a callback off the dispatch path
///
/// A single consumer runs the callback on the blocking pool, so a slow
/// callback delays later events but never the dispatcher. Events arrive in the
/// order they were queued.
pub struct Notifier {
    sender: mpsc::UnboundedSender<Event>,
    worker: JoinHandle<()>,
}

/// Cloneable handle used to queue events
#[derive(Clone)]
pub struct NotifySender {
    sender: mpsc::UnboundedSender<Event>,
}

impl NotifySender {
    /// Queue an event without waiting for it to be delivered
    pub fn notify(&self, event: Event) {
        if self.sender.send(event).is_err() {
            error!("Notifier has shut down, dropping event");
        }
    }
}

impl Notifier {
    /// Start the consumer for `callback`
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(callback: Callback) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(event) = receiver.blocking_recv() {
                callback(event);
            }
            debug!("Notifier drained");
        });
        Self { sender, worker }
    }

    #[must_use]
    pub fn sender(&self) -> NotifySender {
        NotifySender {
            sender: self.sender.clone(),
        }
    }

    /// Queue an event
    pub fn notify(&self, event: Event) {
        if self.sender.send(event).is_err() {
            error!("Notifier consumer is gone, dropping event");
        }
    }

    /// Close the queue and wait until every queued event has been delivered
    ///
    /// Senders obtained from [`Notifier::sender`] must be dropped first, or this
    /// waits for them.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            error!("Notifier callback panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn test_event_kind() {
        let target = Target::new("node1");
        assert_eq!(Event::NodeStart { target: target.clone() }.kind(), "node_start");
        let event = Event::NodeResult {
            result: TargetResult::new(target),
        };
        assert_eq!(event.kind(), "node_result");
        assert_eq!(event.target().name(), "node1");
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notifier = Notifier::start(Arc::new(move |event: Event| {
            std::thread::sleep(Duration::from_millis(5));
            sink.lock().unwrap().push(event.target().name().to_string());
        }));

        let sender = notifier.sender();
        for i in 0..20 {
            sender.notify(Event::NodeStart {
                target: Target::new(format!("node{i}")),
            });
        }
        drop(sender);
        notifier.shutdown().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert_eq!(seen[0], "node0");
        assert_eq!(seen[19], "node19");
    }

    #[tokio::test]
    async fn test_notify_does_not_wait_for_callback() {
        let notifier = Notifier::start(Arc::new(|_event: Event| {
            std::thread::sleep(Duration::from_millis(200));
        }));

        let started = std::time::Instant::now();
        for i in 0..5 {
            notifier.notify(Event::NodeStart {
                target: Target::new(format!("node{i}")),
            });
        }
        assert!(started.elapsed() < Duration::from_millis(100));
        notifier.shutdown().await;
    }
}
