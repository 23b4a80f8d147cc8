//! Broadcast event bus for orchestrator state changes.
//!
//! A single multi-producer, multi-subscriber channel carries structured
//! events to every subscriber. Each subscriber has its own bounded buffer;
//! a slow subscriber loses its oldest events and receives an
//! `events-dropped` notice instead of ever blocking a publisher.

use crate::core::task::TaskId;
use crate::orchestration::worker::WorkerId;
use crate::workflow::WorkflowId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Structured events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    InstanceSpawned {
        worker_id: WorkerId,
    },
    InstanceTerminated {
        worker_id: WorkerId,
    },
    TaskSubmitted {
        task_id: TaskId,
        name: String,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        exit_code: i32,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        reason: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        succeeded: usize,
        failed: usize,
    },
    /// Delivered to a subscriber that fell behind; `count` events were lost.
    EventsDropped {
        count: u64,
    },
    /// An orchestrator-internal fault surfaced to stream observers.
    Error {
        message: String,
    },
}

impl Event {
    /// The kebab-case kind tag, used for subscription filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::InstanceSpawned { .. } => "instance-spawned",
            Event::InstanceTerminated { .. } => "instance-terminated",
            Event::TaskSubmitted { .. } => "task-submitted",
            Event::TaskReady { .. } => "task-ready",
            Event::TaskStarted { .. } => "task-started",
            Event::TaskCompleted { .. } => "task-completed",
            Event::TaskFailed { .. } => "task-failed",
            Event::TaskCancelled { .. } => "task-cancelled",
            Event::WorkflowCompleted { .. } => "workflow-completed",
            Event::EventsDropped { .. } => "events-dropped",
            Event::Error { .. } => "error",
        }
    }
}

/// Handle for publishing events and creating subscriptions.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing never blocks; an empty subscriber set is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Open a new subscription starting at the current stream position.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// A single subscriber's view of the event stream.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event.
    ///
    /// When this subscriber lagged behind and lost events, an
    /// `EventsDropped` notice is returned in their place. `None` means
    /// the bus has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Event::EventsDropped { count })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-blocking receive, used by tests and snapshot handlers.
    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Event::EventsDropped { count })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_tags() {
        let event = Event::TaskReady {
            task_id: TaskId::new(),
        };
        assert_eq!(event.kind(), "task-ready");
        assert_eq!(Event::EventsDropped { count: 3 }.kind(), "events-dropped");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::TaskCompleted {
            task_id: TaskId::new(),
            exit_code: 0,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"task-completed\""));
        assert!(json.contains("exit_code"));
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe();
        let event = Event::TaskSubmitted {
            task_id: TaskId::new(),
            name: "build".to_string(),
        };
        bus.publish(event.clone());
        assert_eq!(stream.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(4);
        for _ in 0..100 {
            bus.publish(Event::EventsDropped { count: 1 });
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_every_event() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let event = Event::InstanceSpawned {
            worker_id: WorkerId(1),
        };
        bus.publish(event.clone());
        assert_eq!(first.recv().await, Some(event.clone()));
        assert_eq!(second.recv().await, Some(event));
    }

    #[tokio::test]
    async fn test_slow_subscriber_gets_dropped_notice() {
        let bus = EventBus::new(2);
        let mut stream = bus.subscribe();
        for i in 0..5 {
            bus.publish(Event::EventsDropped { count: i });
        }
        // The first receive reports the overflow rather than the lost events.
        match stream.recv().await {
            Some(Event::EventsDropped { count }) => assert!(count > 0),
            other => panic!("expected EventsDropped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe();
        assert!(stream.try_recv().is_none());
        bus.publish(Event::EventsDropped { count: 1 });
        assert!(stream.try_recv().is_some());
    }
}
