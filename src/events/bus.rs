use super::types::{EventKind, TaskEvent};
use futures::Stream;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

/// Fire-and-forget publish/subscribe on top of tokio broadcast channels.
///
/// One channel per topic plus one carrying everything. Publishing never
/// blocks: events nobody listens to are dropped, and a subscriber that falls
/// more than `capacity` events behind loses the oldest ones.
pub struct EventBus {
    topics: HashMap<EventKind, broadcast::Sender<TaskEvent>>,
    all: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let topics = EventKind::ALL
            .into_iter()
            .map(|kind| (kind, broadcast::channel(capacity).0))
            .collect();
        let (all, _) = broadcast::channel(capacity);

        Self { topics, all }
    }

    /// Publish to the event's topic and to the firehose.
    ///
    /// Returns how many subscribers received it.
    pub fn publish(&self, event: TaskEvent) -> usize {
        debug!(
            task_id = %event.task_id,
            kind = %event.task_kind,
            attempt = event.attempts,
            "Event {}",
            event.kind
        );

        let mut delivered = 0;
        if let Some(sender) = self.topics.get(&event.kind) {
            delivered += sender.send(event.clone()).unwrap_or(0);
        }
        delivered += self.all.send(event).unwrap_or(0);
        delivered
    }

    /// Events of one topic published from now on
    pub fn subscribe(&self, kind: EventKind) -> EventStream {
        let receiver = match self.topics.get(&kind) {
            Some(sender) => sender.subscribe(),
            // Every topic is created up front
            None => self.all.subscribe(),
        };
        EventStream {
            receiver,
            label: kind.as_str(),
        }
    }

    /// Every event published from now on, in publish order
    pub fn subscribe_all(&self) -> EventStream {
        EventStream {
            receiver: self.all.subscribe(),
            label: "all",
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.topics
            .get(&kind)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Receiving end of a subscription
pub struct EventStream {
    receiver: broadcast::Receiver<TaskEvent>,
    label: &'static str,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Subscriber on '{}' lagged, {} events lost", self.label, missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-published event, without waiting
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!("Subscriber on '{}' lagged, {} events lost", self.label, missed);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|event| (event, stream))
        })
    }
}
