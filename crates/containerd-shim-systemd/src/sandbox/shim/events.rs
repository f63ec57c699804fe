use async_trait::async_trait;
use containerd_shim::event::Event as ShimEvent;
use containerd_shim::protos::protobuf::well_known_types::any::Any;
use containerd_shim::util::convert_to_any;
pub use containerd_shim::protos::events::task::{
    TaskCreate, TaskDelete, TaskExecAdded, TaskExit, TaskIO, TaskStart,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::sandbox::Result;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    TaskCreate(TaskCreate),
    TaskStart(TaskStart),
    TaskDelete(TaskDelete),
    TaskExit(TaskExit),
    TaskExecAdded(TaskExecAdded),
}

impl Event {
    pub fn topic(&self) -> String {
        match self {
            Event::TaskCreate(e) => e.topic(),
            Event::TaskStart(e) => e.topic(),
            Event::TaskDelete(e) => e.topic(),
            Event::TaskExit(e) => e.topic(),
            Event::TaskExecAdded(e) => e.topic(),
        }
    }

    /// Wraps the event the way containerd's event service expects it.
    pub fn to_any(&self) -> Result<Any> {
        let any = match self {
            Event::TaskCreate(e) => convert_to_any(Box::new(e.clone()))?,
            Event::TaskStart(e) => convert_to_any(Box::new(e.clone()))?,
            Event::TaskDelete(e) => convert_to_any(Box::new(e.clone()))?,
            Event::TaskExit(e) => convert_to_any(Box::new(e.clone()))?,
            Event::TaskExecAdded(e) => convert_to_any(Box::new(e.clone()))?,
        };
        Ok(any)
    }
}

/// Publishes task events to containerd.
/// Publishing is best effort: failures are logged by the implementation and
/// never fail the task operation that produced the event.
#[async_trait]
pub trait EventSender: Send + Sync + 'static {
    async fn send(&self, namespace: &str, event: Event);
}

#[async_trait]
impl EventSender for UnboundedSender<(String, Event)> {
    async fn send(&self, namespace: &str, event: Event) {
        if let Err(err) = UnboundedSender::send(self, (namespace.to_string(), event)) {
            log::warn!("failed to publish event, topic: {}", err.0.1.topic());
        }
    }
}

#[cfg(test)]
mod tests {
    use containerd_shim::protos::protobuf::Message as _;

    use super::*;

    #[test]
    fn test_exec_added_any() {
        let event = Event::TaskExecAdded(TaskExecAdded {
            container_id: "c1".into(),
            exec_id: "e1".into(),
            ..Default::default()
        });
        assert_eq!(event.topic(), "/tasks/exec-added");

        let any = event.to_any().unwrap();
        assert!(any.type_url.ends_with("containerd.events.TaskExecAdded"));
        let decoded = TaskExecAdded::parse_from_bytes(&any.value).unwrap();
        assert_eq!(decoded.container_id, "c1");
        assert_eq!(decoded.exec_id, "e1");
    }

    #[tokio::test]
    async fn test_channel_sender() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let event = Event::TaskStart(TaskStart {
            container_id: "c1".into(),
            pid: 10,
            ..Default::default()
        });
        EventSender::send(&tx, "default", event.clone()).await;
        assert_eq!(rx.recv().await.unwrap(), ("default".to_string(), event));
    }
}
