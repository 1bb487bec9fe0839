use super::*;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::signaling::LocalRelay;
use crate::transport::{BoxStream, MemoryConnector, PendingOffer};

/// Memory transport that counts offers.
#[derive(Clone, Default)]
struct CountingConnector {
    inner: MemoryConnector,
    offers: Arc<AtomicUsize>,
}

impl Connector for CountingConnector {
    fn offer(
        &self,
        peer: &PeerId,
    ) -> BoxFuture<'static, Result<(Vec<u8>, Box<dyn PendingOffer>), TransportError>> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        self.inner.offer(peer)
    }

    fn answer(
        &self,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> BoxFuture<'static, Result<(Vec<u8>, BoxStream), TransportError>> {
        self.inner.answer(peer, offer)
    }
}

struct Node {
    links: PeerLinkManager,
    inbound: LinkInbound,
    events: broadcast::Receiver<Event>,
}

fn settings() -> LinkSettings {
    LinkSettings {
        negotiation_timeout: Duration::from_millis(500),
        reconnect_backoff: Duration::from_millis(20),
        max_reconnect_attempts: 2,
    }
}

fn node(relay: &LocalRelay, connector: Arc<dyn Connector>, id: &str) -> Node {
    let bus = EventBus::default();
    let events = bus.subscribe();
    let (links, inbound) = PeerLinkManager::start(
        PeerId::from(id),
        settings(),
        connector,
        Arc::new(relay.client()),
        bus,
        &[],
    )
    .unwrap();
    Node {
        links,
        inbound,
        events,
    }
}

async fn wait_for(rx: &mut broadcast::Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen in time")
}

fn connected(peer: &str) -> impl Fn(&Event) -> bool + '_ {
    move |e| matches!(e, Event::PeerConnected { peer_id } if peer_id.as_str() == peer)
}

#[tokio::test]
async fn connect_opens_all_channels_on_both_sides() {
    let relay = LocalRelay::new();
    let hub = Arc::new(MemoryConnector::new());
    let mut a = node(&relay, hub.clone(), "a");
    let mut b = node(&relay, hub, "b");

    let link = a.links.connect(&PeerId::from("b")).unwrap();
    assert!(link.is_initiator());

    wait_for(&mut a.events, connected("b")).await;
    wait_for(&mut b.events, connected("a")).await;

    assert_eq!(link.state(), LinkState::Connected);
    // Channel opens can trail the connected event by a frame or two.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(link.channels().iter().all(|c| c.ready));
    assert!(b.links.channel_ready(&PeerId::from("a"), Channel::Bulk));
    assert_eq!(a.links.link_state(&PeerId::from("b")), Some(LinkState::Connected));
    assert_eq!(a.links.link_state(&PeerId::from("z")), None);
    assert_eq!(b.links.connected_peers(), vec![PeerId::from("a")]);
    assert!(!b.links.link(&PeerId::from("a")).unwrap().is_initiator());
}

#[tokio::test]
async fn concurrent_connects_share_one_negotiation() {
    let relay = LocalRelay::new();
    let hub = MemoryConnector::new();
    let counting = CountingConnector {
        inner: hub.clone(),
        offers: Arc::new(AtomicUsize::new(0)),
    };
    let offers = counting.offers.clone();
    let mut a = node(&relay, Arc::new(counting), "a");
    let _b = node(&relay, Arc::new(hub), "b");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let links = a.links.clone();
            tokio::spawn(async move { links.connect(&PeerId::from("b")).unwrap() })
        })
        .collect();
    let mut generations = Vec::new();
    for h in handles {
        generations.push(h.await.unwrap().generation());
    }
    generations.dedup();
    assert_eq!(generations.len(), 1);

    wait_for(&mut a.events, connected("b")).await;
    assert_eq!(offers.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bulk_and_reliable_payloads_arrive() {
    let relay = LocalRelay::new();
    let hub = Arc::new(MemoryConnector::new());
    let mut a = node(&relay, hub.clone(), "a");
    let mut b = node(&relay, hub, "b");

    let peer_b = PeerId::from("b");
    assert!(matches!(
        a.links.send_bulk(&peer_b, vec![1]),
        Err(LinkError::ChannelNotReady { channel: Channel::Bulk, .. })
    ));
    assert!(matches!(
        a.links.send_reliable(&peer_b, vec![1]),
        Err(LinkError::NoLink(_))
    ));

    a.links.connect(&peer_b).unwrap();
    wait_for(&mut a.events, connected("b")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.links.send_reliable(&peer_b, b"hello".to_vec()).unwrap();
    a.links.send_bulk(&peer_b, vec![0xab; 4096]).unwrap();

    let mut got_message = false;
    let mut got_bulk = false;
    while !(got_message && got_bulk) {
        let event = tokio::time::timeout(Duration::from_secs(2), b.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LinkEvent::Message { peer, channel, payload } => {
                assert_eq!(peer, PeerId::from("a"));
                assert_eq!(channel, Channel::Reliable);
                assert_eq!(payload, b"hello");
                got_message = true;
            }
            LinkEvent::Bulk { payload, .. } => {
                assert_eq!(payload.len(), 4096);
                got_bulk = true;
            }
            LinkEvent::ChannelOpen { .. } => {}
        }
    }
}

#[tokio::test]
async fn oversized_frames_are_refused_and_link_survives() {
    let relay = LocalRelay::new();
    let hub = Arc::new(MemoryConnector::new());
    let mut a = node(&relay, hub.clone(), "a");
    let mut b = node(&relay, hub, "b");

    let peer_b = PeerId::from("b");
    a.links.connect(&peer_b).unwrap();
    wait_for(&mut a.events, connected("b")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let too_big = vec![0u8; MAX_FRAME_PAYLOAD + 1];
    assert!(matches!(
        a.links.send_bulk(&peer_b, too_big.clone()),
        Err(LinkError::PayloadTooLarge { len, .. }) if len == MAX_FRAME_PAYLOAD + 1
    ));
    assert!(matches!(
        a.links.send_reliable(&peer_b, too_big.clone()),
        Err(LinkError::PayloadTooLarge { .. })
    ));
    assert!(matches!(
        a.links.send_unreliable(&peer_b, too_big),
        Err(LinkError::PayloadTooLarge { .. })
    ));

    a.links.send_bulk(&peer_b, vec![7; MAX_FRAME_PAYLOAD]).unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), b.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        if let LinkEvent::Bulk { payload, .. } = event {
            assert_eq!(payload.len(), MAX_FRAME_PAYLOAD);
            break;
        }
    }
    assert_eq!(a.links.link_state(&peer_b), Some(LinkState::Connected));
    assert!(a.links.channel_ready(&peer_b, Channel::Bulk));
}

#[tokio::test]
async fn simultaneous_connects_resolve_to_one_link() {
    let relay = LocalRelay::new();
    let hub = Arc::new(MemoryConnector::new());
    let mut a = node(&relay, hub.clone(), "a");
    let mut b = node(&relay, hub, "b");

    a.links.connect(&PeerId::from("b")).unwrap();
    b.links.connect(&PeerId::from("a")).unwrap();

    wait_for(&mut a.events, connected("b")).await;
    wait_for(&mut b.events, connected("a")).await;

    let at_a = a.links.link(&PeerId::from("b")).unwrap();
    let at_b = b.links.link(&PeerId::from("a")).unwrap();
    assert_eq!(at_a.state(), LinkState::Connected);
    assert_eq!(at_b.state(), LinkState::Connected);
    assert_ne!(at_a.is_initiator(), at_b.is_initiator());
    assert_eq!(a.links.snapshot().len(), 1);
    assert_eq!(b.links.snapshot().len(), 1);
}

#[tokio::test]
async fn disconnect_removes_link_without_reconnecting() {
    let relay = LocalRelay::new();
    let hub = Arc::new(MemoryConnector::new());
    let mut a = node(&relay, hub.clone(), "a");
    let mut b = node(&relay, hub, "b");

    a.links.connect(&PeerId::from("b")).unwrap();
    wait_for(&mut a.events, connected("b")).await;
    wait_for(&mut b.events, connected("a")).await;

    assert!(a.links.disconnect(&PeerId::from("b")));
    assert!(!a.links.disconnect(&PeerId::from("b")));
    assert!(a.links.link(&PeerId::from("b")).is_none());

    wait_for(&mut b.events, |e| matches!(e, Event::PeerRemoved { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.links.link(&PeerId::from("b")).is_none());
    assert!(b.links.link(&PeerId::from("a")).is_none());
}

#[tokio::test]
async fn unreachable_peer_is_eventually_gone() {
    let relay = LocalRelay::new();
    let counting = CountingConnector::default();
    let offers = counting.offers.clone();
    let mut a = node(&relay, Arc::new(counting), "a");

    a.links.connect(&PeerId::from("ghost")).unwrap();
    wait_for(
        &mut a.events,
        |e| matches!(e, Event::PeerGone { peer_id } if peer_id.as_str() == "ghost"),
    )
    .await;

    // The first attempt plus two reconnects.
    assert_eq!(offers.load(Ordering::SeqCst), 3);
    assert!(a.links.link(&PeerId::from("ghost")).is_none());
}

#[tokio::test]
async fn silent_peer_times_out_negotiation() {
    let relay = LocalRelay::new();
    // Registered but never answers.
    let _silent = relay.client();
    let _rx = _silent.register(&PeerId::from("mute"), &[]).unwrap();

    let mut a = node(&relay, Arc::new(MemoryConnector::new()), "a");
    let link = a.links.connect(&PeerId::from("mute")).unwrap();
    assert_eq!(link.state(), LinkState::Negotiating);

    wait_for(&mut a.events, |e| matches!(e, Event::PeerRemoved { .. })).await;
    assert_eq!(link.state(), LinkState::Closed);
    wait_for(&mut a.events, |e| matches!(e, Event::PeerGone { .. })).await;
}

#[tokio::test]
async fn shutdown_stops_reconnects() {
    let relay = LocalRelay::new();
    let counting = CountingConnector::default();
    let offers = counting.offers.clone();
    let a = node(&relay, Arc::new(counting), "a");

    a.links.connect(&PeerId::from("ghost")).unwrap();
    a.links.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(offers.load(Ordering::SeqCst) <= 1);
    assert!(a.links.snapshot().is_empty());
}

#[tokio::test]
async fn self_connect_is_refused() {
    let relay = LocalRelay::new();
    let a = node(&relay, Arc::new(MemoryConnector::new()), "a");
    assert!(matches!(
        a.links.connect(&PeerId::from("a")),
        Err(LinkError::SelfConnect)
    ));
}
