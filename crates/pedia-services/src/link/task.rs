//! The task behind one [`PeerLink`]: negotiate, run the channel
//! multiplexer, then clean up and decide whether to reconnect.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use pedia_core::wire::{Channel, FrameKind};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::state::{LinkCommand, LinkState, PeerLink};
use super::{LinkError, LinkEvent, Shared};
use crate::events::Event;
use crate::signaling::{Signal, SignalingError};
use crate::transport::{read_frame, write_frame, BoxStream};

pub(crate) enum Role {
    Initiator,
    Responder { offer: Vec<u8> },
}

#[derive(Debug)]
enum Exit {
    /// We closed it (disconnect, replacement or shutdown).
    Local,
    /// The peer sent a close frame.
    Remote,
    Failed(String),
}

impl Exit {
    fn unexpected(&self) -> bool {
        matches!(self, Exit::Failed(_))
    }
}

pub(crate) async fn drive(
    shared: Arc<Shared>,
    link: Arc<PeerLink>,
    role: Role,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    unreliable: mpsc::Receiver<Vec<u8>>,
) {
    let negotiated = tokio::select! {
        result = tokio::time::timeout(
            shared.settings.negotiation_timeout,
            negotiate(&shared, &link, role),
        ) => match result {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Exit::Failed(e.to_string())),
            Err(_) => Err(Exit::Failed(
                LinkError::NegotiationTimeout(link.peer().clone()).to_string(),
            )),
        },
        _ = closed(&mut commands) => Err(Exit::Local),
    };

    let exit = match negotiated {
        Ok(stream) => run(&shared, &link, stream, commands, unreliable).await,
        Err(exit) => exit,
    };
    finish(&shared, &link, exit);
}

/// Resolves when a close is requested before the link is up. Sends cannot
/// be queued then because no channel is ready.
async fn closed(commands: &mut mpsc::UnboundedReceiver<LinkCommand>) {
    while let Some(cmd) = commands.recv().await {
        if matches!(cmd, LinkCommand::Close) {
            return;
        }
    }
}

async fn negotiate(shared: &Shared, link: &PeerLink, role: Role) -> Result<BoxStream, LinkError> {
    let peer = link.peer();
    match role {
        Role::Initiator => {
            let (offer, pending) = shared.connector.offer(peer).await?;
            let answer = link.arm_answer();
            shared.signaling.relay(peer, Signal::offer(offer))?;
            // A withdrawn slot means the relay reported the peer absent.
            let answer = answer
                .await
                .map_err(|_| SignalingError::PeerUnreachable(peer.clone()))?;
            Ok(pending.complete(answer).await?)
        }
        Role::Responder { offer } => {
            let (answer, stream) = shared.connector.answer(peer, offer).await?;
            shared.signaling.relay(peer, Signal::answer(answer))?;
            Ok(stream)
        }
    }
}

async fn run(
    shared: &Shared,
    link: &PeerLink,
    stream: BoxStream,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut unreliable: mpsc::Receiver<Vec<u8>>,
) -> Exit {
    let peer = link.peer().clone();
    let (mut reader, mut writer) = tokio::io::split(stream);

    // Reads are not cancel-safe inside select!, so they get their own task.
    let (frame_tx, mut frames) = mpsc::channel(64);
    let reader_task = tokio::spawn(async move {
        loop {
            let item = match read_frame(&mut reader).await {
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err("stream ended".to_string()),
                Err(e) => Err(e.to_string()),
            };
            let last = item.is_err();
            if frame_tx.send(item).await.is_err() || last {
                break;
            }
        }
    });

    let mut exit = None;
    for channel in Channel::ALL {
        if let Err(e) = write_frame(&mut writer, channel, FrameKind::Open, &[]).await {
            exit = Some(Exit::Failed(e.to_string()));
            break;
        }
    }

    let exit = match exit {
        Some(exit) => exit,
        None => loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(LinkCommand::Send { channel, payload }) => {
                        if let Err(e) = write_frame(&mut writer, channel, FrameKind::Data, &payload).await {
                            break Exit::Failed(e.to_string());
                        }
                        link.with_status(|s| s.touch());
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = write_frame(&mut writer, Channel::Reliable, FrameKind::Close, &[]).await;
                        let _ = writer.shutdown().await;
                        break Exit::Local;
                    }
                },

                Some(payload) = unreliable.recv() => {
                    if let Err(e) = write_frame(&mut writer, Channel::Unreliable, FrameKind::Data, &payload).await {
                        break Exit::Failed(e.to_string());
                    }
                }

                frame = frames.recv() => match frame {
                    Some(Ok((channel, FrameKind::Open, _))) => on_channel_open(shared, link, channel),
                    Some(Ok((channel, FrameKind::Data, payload))) => {
                        link.with_status(|s| s.touch());
                        let event = match channel {
                            Channel::Bulk => LinkEvent::Bulk { peer: peer.clone(), payload },
                            _ => LinkEvent::Message { peer: peer.clone(), channel, payload },
                        };
                        let _ = shared.inbound.send(event);
                    }
                    Some(Ok((_, FrameKind::Close, _))) => break Exit::Remote,
                    Some(Err(e)) => break Exit::Failed(e),
                    None => break Exit::Failed("reader stopped".to_string()),
                },
            }
        },
    };

    reader_task.abort();
    exit
}

fn on_channel_open(shared: &Shared, link: &PeerLink, channel: Channel) {
    let connected = link.with_status(|s| {
        s.mark_ready(channel);
        channel == Channel::Reliable && s.advance(LinkState::Connected)
    });
    tracing::debug!(peer = %link.peer(), channel = channel.name(), "channel open");

    if connected {
        shared.reconnects.remove(link.peer());
        tracing::info!(peer = %link.peer(), generation = link.generation(), "peer connected");
        shared.events.emit(Event::PeerConnected {
            peer_id: link.peer().clone(),
        });
    }
    // Readiness is recorded before the router hears about it, so a flush
    // triggered by this event can send directly.
    let _ = shared.inbound.send(LinkEvent::ChannelOpen {
        peer: link.peer().clone(),
        channel,
    });
}

fn finish(shared: &Arc<Shared>, link: &Arc<PeerLink>, exit: Exit) {
    link.with_status(|s| s.advance(LinkState::Closed));
    let peer = link.peer().clone();

    let removed = shared
        .links
        .remove_if(&peer, |_, l| l.generation() == link.generation())
        .is_some();

    match &exit {
        Exit::Failed(reason) => {
            tracing::warn!(peer = %peer, generation = link.generation(), reason = %reason, "link failed")
        }
        other => {
            tracing::debug!(peer = %peer, generation = link.generation(), exit = ?other, "link closed")
        }
    }

    if !removed {
        return;
    }
    shared.events.emit(Event::PeerRemoved {
        peer_id: peer.clone(),
    });

    if exit.unexpected()
        && link.is_initiator()
        && !shared.shutting_down.load(Ordering::SeqCst)
    {
        shared.schedule_reconnect(peer);
    }
}
