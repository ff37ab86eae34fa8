//! The deprovision work queue.
//!
//! Any number of producers, exactly one consumer (the deprovision loop).
//! Duplicate requests are harmless: the consumer skips resources that are
//! already winding down.

use spotgrid_state::ResourceId;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeprovisionRequest {
    pub resource_id: ResourceId,
    pub reason: String,
}

/// Producer side of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DeprovisionQueue {
    tx: mpsc::Sender<DeprovisionRequest>,
}

impl DeprovisionQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DeprovisionRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Post a request, waiting for room. Returns false once the consumer is gone.
    pub async fn enqueue(&self, resource_id: ResourceId, reason: impl Into<String>) -> bool {
        let request = DeprovisionRequest {
            resource_id,
            reason: reason.into(),
        };
        match self.tx.send(request).await {
            Ok(()) => true,
            Err(_) => {
                warn!(resource_id, "deprovision queue closed, request dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn requests_arrive_in_order() {
        let (queue, mut rx) = DeprovisionQueue::new(4);
        assert!(queue.enqueue(1, "idle").await);
        assert!(queue.clone().enqueue(2, String::from("unhealthy")).await);
        assert_eq!(rx.recv().await.unwrap().resource_id, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.resource_id, 2);
        assert_eq!(second.reason, "unhealthy");
    }

    #[tokio::test]
    async fn closed_queue_drops_requests() {
        let (queue, rx) = DeprovisionQueue::new(1);
        drop(rx);
        assert!(!queue.enqueue(1, "late").await);
    }
}
