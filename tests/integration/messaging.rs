use crate::*;

use std::sync::Mutex;

use pedia_core::wire::Envelope;
use pedia_services::router::MessageHandler;
use pedia_services::SendStatus;

#[derive(Default)]
struct Inbox {
    seen: Mutex<Vec<(PeerId, serde_json::Value)>>,
}

impl MessageHandler for Inbox {
    fn handle_message(&self, peer: &PeerId, envelope: &Envelope) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((peer.clone(), envelope.data.clone()));
        Ok(())
    }
}

impl Inbox {
    fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Messages sent before the link exists are held and delivered in order,
/// exactly once, when the reliable channel opens.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_messages_flush_in_order() -> Result<()> {
    let mesh = Mesh::new();
    let a = mesh.node("alice")?;
    let b = mesh.node("bob")?;
    let inbox = Arc::new(Inbox::default());
    b.router.register("chat", inbox.clone());

    for n in 0..3 {
        let status = a.router.send(&b.id, "chat", &serde_json::json!({ "n": n }))?;
        assert_eq!(status, SendStatus::Queued);
    }
    assert_eq!(a.router.pending(&b.id).len(), 3);

    link(&a, &b).await?;
    wait_for(10, || inbox.len() == 3).await?;
    assert_eq!(a.router.pending_total(), 0);

    let seen = inbox.seen.lock().unwrap().clone();
    let order: Vec<i64> = seen.iter().filter_map(|(_, v)| v["n"].as_i64()).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(seen.iter().all(|(from, _)| *from == a.id));

    // Once open, sends go straight out.
    let status = a.router.send(&b.id, "chat", &serde_json::json!({ "n": 3 }))?;
    assert_eq!(status, SendStatus::Delivered);
    wait_for(10, || inbox.len() == 4).await?;

    a.shutdown();
    b.shutdown();
    Ok(())
}

/// Envelopes without a registered handler are dropped without disturbing
/// the ones that have one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_message_types_are_ignored() -> Result<()> {
    let mesh = Mesh::new();
    let a = mesh.node("alice")?;
    let b = mesh.node("bob")?;
    let inbox = Arc::new(Inbox::default());
    b.router.register("chat", inbox.clone());
    link(&a, &b).await?;

    a.router.send(&b.id, "no-such-type", &serde_json::json!({}))?;
    a.router.send(&b.id, "chat", &serde_json::json!({ "n": 1 }))?;
    wait_for(10, || inbox.len() == 1).await?;
    assert!(b.links.is_connected(&a.id));

    a.shutdown();
    b.shutdown();
    Ok(())
}
