use crate::*;

use std::net::{IpAddr, Ipv4Addr};

use pedia_services::{
    DownloadOptions, LinkState, RelayServer, ShareOptions, TcpConnector, TcpSignaling,
};
use tokio::sync::broadcast;

async fn tcp_node(id: &str, relay: &str) -> Result<Node> {
    let signaling = TcpSignaling::connect(relay).await?;
    let connector = TcpConnector::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
    start_node(id, Arc::new(connector), Arc::new(signaling))
}

/// Two nodes on loopback: signaling through a real relay, chunks over
/// real TCP streams.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_share_and_download_over_tcp() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let relay = RelayServer::bind("127.0.0.1:0", shutdown_tx.subscribe()).await?;
    let relay_addr = relay.local_addr()?.to_string();
    let relay_task = tokio::spawn(relay.run());

    let a = tcp_node("alice", &relay_addr).await?;
    let b = tcp_node("bob", &relay_addr).await?;
    join_room(&[&a, &b]);
    link(&a, &b).await?;

    let data = payload(200 * 1024);
    let file_id = a.engine.share_file(
        &data,
        &TopicId::from(ROOM),
        ShareOptions::named("over-tcp.bin"),
    )?;
    let manifests = b.engine.manifests().clone();
    let id = file_id.clone();
    wait_for(10, move || matches!(manifests.get_manifest(&id), Ok(Some(_)))).await?;

    let path = b
        .engine
        .download_file(&file_id, DownloadOptions::default())
        .await?;
    assert_eq!(std::fs::read(path)?, data);

    a.shutdown();
    b.shutdown();
    let _ = shutdown_tx.send(());
    relay_task.await??;
    Ok(())
}

/// Connecting to a peer the relay has never seen fails the link rather
/// than leaving it negotiating.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_peer_is_unreachable() -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let relay = RelayServer::bind("127.0.0.1:0", shutdown_tx.subscribe()).await?;
    let relay_addr = relay.local_addr()?.to_string();
    tokio::spawn(relay.run());

    let a = tcp_node("alice", &relay_addr).await?;
    let ghost = PeerId::from("ghost");
    a.links.connect(&ghost)?;
    wait_for(10, || {
        a.links
            .link(&ghost)
            .map(|l| l.state() == LinkState::Closed)
            .unwrap_or(true)
    })
    .await?;
    assert!(!a.links.is_connected(&ghost));

    a.shutdown();
    let _ = shutdown_tx.send(());
    Ok(())
}
