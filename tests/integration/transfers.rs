use crate::*;

use pedia_core::FileId;
use pedia_services::{DownloadOptions, Priority, ShareOptions, TransferError};

/// Wait until `node` has stored the manifest for `file_id`.
async fn await_manifest(node: &Node, file_id: &FileId) -> Result<()> {
    let manifests = node.engine.manifests().clone();
    let id = file_id.clone();
    wait_for(10, move || matches!(manifests.get_manifest(&id), Ok(Some(_)))).await
}

/// A shares to a three-node room; B and C download it at the same time
/// and both end up with identical bytes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_share_reaches_room_and_downloads_concurrently() -> Result<()> {
    let mesh = Mesh::new();
    let a = mesh.node("alice")?;
    let b = mesh.node("bob")?;
    let c = mesh.node("carol")?;
    join_room(&[&a, &b, &c]);
    link(&a, &b).await?;
    link(&a, &c).await?;

    let data = payload(300 * 1024);
    let file_id = a.engine.share_file(
        &data,
        &TopicId::from(ROOM),
        ShareOptions::named("report.bin"),
    )?;
    assert_eq!(a.engine.local_files(), vec![file_id.clone()]);

    await_manifest(&b, &file_id).await?;
    await_manifest(&c, &file_id).await?;
    assert_eq!(b.engine.holders(&file_id), vec![a.id.clone()]);

    let mut b_events = b.events.subscribe();
    let (got_b, got_c) = tokio::join!(
        b.engine.download_file(&file_id, DownloadOptions::default()),
        c.engine.download_file(
            &file_id,
            DownloadOptions {
                priority: Priority::High,
                ..DownloadOptions::default()
            }
        ),
    );
    let path_b = got_b?;
    let path_c = got_c?;

    assert!(path_b.ends_with("report.bin"));
    assert_eq!(std::fs::read(&path_b)?, data);
    assert_eq!(std::fs::read(&path_c)?, data);
    assert!(b.engine.local_files().contains(&file_id));
    assert!(b.engine.active_transfers().is_empty());

    let mut fractions = Vec::new();
    let mut completed = false;
    while let Ok(event) = b_events.try_recv() {
        match event {
            Event::DownloadProgress { fraction, .. } => fractions.push(fraction),
            Event::DownloadComplete { file_id: f, .. } if f == file_id => completed = true,
            _ => {}
        }
    }
    assert!(completed, "no completion event");
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{fractions:?}");
    assert_eq!(fractions.last().copied(), Some(1.0));

    // Every chunk bob fetched counted towards alice's standing.
    let stats = b.engine.scores().stats(&a.id);
    assert_eq!(stats.successes, 5);
    assert_eq!(stats.attempts, 5);
    assert!(stats.avg_throughput > 0.0);

    for node in [&a, &b, &c] {
        node.shutdown();
    }
    Ok(())
}

/// Peers outside the topic never see the announcement.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_announcement_stays_inside_topic() -> Result<()> {
    let mesh = Mesh::new();
    let a = mesh.node("alice")?;
    let b = mesh.node("bob")?;
    let outsider = mesh.node("mallory")?;
    join_room(&[&a, &b]);
    link(&a, &b).await?;
    link(&a, &outsider).await?;

    let file_id = a.engine.share_file(
        &payload(10_000),
        &TopicId::from(ROOM),
        ShareOptions::named("notes.txt"),
    )?;
    await_manifest(&b, &file_id).await?;

    // Give a stray announcement time to land before checking.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(outsider.engine.manifests().get_manifest(&file_id)?.is_none());

    let err = outsider
        .engine
        .download_file(&file_id, DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::ManifestNotFound(_)), "{err}");

    for node in [&a, &b, &outsider] {
        node.shutdown();
    }
    Ok(())
}

/// A download whose only holder has left fails instead of hanging, and
/// whatever it fetched is released by garbage collection.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_holder_fails_transfer() -> Result<()> {
    let mesh = Mesh::new();
    let a = mesh.node("alice")?;
    let b = mesh.node("bob")?;
    join_room(&[&a, &b]);
    link(&a, &b).await?;

    let file_id = a.engine.share_file(
        &payload(512 * 1024),
        &TopicId::from(ROOM),
        ShareOptions::named("big.bin"),
    )?;
    await_manifest(&b, &file_id).await?;

    a.shutdown();
    mesh.relay.unregister(&a.id);
    wait_for(10, || !b.links.is_connected(&a.id)).await?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        b.engine.download_file(&file_id, DownloadOptions::default()),
    )
    .await?;
    assert!(
        matches!(outcome, Err(TransferError::ChunkUnavailable { .. })),
        "{outcome:?}"
    );
    assert!(b.engine.transfer_progress(&file_id).is_none());
    assert!(b.engine.local_files().is_empty());

    b.engine.collect_garbage()?;
    assert_eq!(b.engine.store().count(), 0);

    b.shutdown();
    Ok(())
}
