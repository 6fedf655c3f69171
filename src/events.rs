use tokio::sync::broadcast;

/// Notifications for external collaborators (the ACME client, dashboards).
/// This channel is the only path from the core outward — the core never
/// calls collaborator code directly.
#[derive(Debug, Clone)]
pub enum EdgeEvent {
    /// An admin asked for a certificate that does not exist yet. The ACME
    /// collaborator acquires it and writes the record into the store.
    CertificateRequested { domain: String },
    /// An admin asked for an early renewal of an existing certificate.
    CertificateRenewalRequested { id: uuid::Uuid, domain: String },
    /// A health probe flipped a backend's selectable status.
    BackendHealthChanged {
        pool: String,
        backend_id: String,
        healthy: bool,
    },
}

/// Broadcast fan-out for `EdgeEvent`. Cheap to clone; publishing with no
/// subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EdgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: EdgeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EdgeEvent::CertificateRequested {
            domain: "example.com".into(),
        });
        match rx.recv().await.unwrap() {
            EdgeEvent::CertificateRequested { domain } => assert_eq!(domain, "example.com"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(EdgeEvent::BackendHealthChanged {
            pool: "p".into(),
            backend_id: "http://a:1".into(),
            healthy: false,
        });
    }
}
