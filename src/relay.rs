use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::signaling::RelayMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Sending side of the relay channel, held by the session. Messages sent while
/// the transport is down are dropped, not queued; `shutdown` is the explicit
/// cancellation hook that ends the reconnect loop.
pub struct RelayHandle {
    outbound: mpsc::UnboundedSender<RelayMessage>,
    status: watch::Receiver<RelayStatus>,
    shutdown: watch::Sender<bool>,
}

impl RelayHandle {
    pub fn send(&self, message: RelayMessage) {
        if self.outbound.send(message).is_err() {
            debug!("relay task gone, message dropped");
        }
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
impl RelayHandle {
    /// A handle wired to nothing but an inspectable outbound channel.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (_status_tx, status) = watch::channel(RelayStatus::Connected);
        let (shutdown, _shutdown_rx) = watch::channel(false);
        (
            Self {
                outbound,
                status,
                shutdown,
            },
            rx,
        )
    }
}

/// Owns the WebSocket to the signaling relay. Connects, announces `join`,
/// pumps frames both ways, and on loss retries with exponential backoff until
/// shut down. Peer links are never touched from here; only the channel is
/// recreated.
pub struct RelaySupervisor;

impl RelaySupervisor {
    pub fn spawn(
        url: String,
        room: String,
        username: String,
        policy: ReconnectPolicy,
    ) -> (
        RelayHandle,
        mpsc::UnboundedReceiver<RelayMessage>,
        watch::Receiver<RelayStatus>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RelayStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_supervisor(
            url,
            room,
            username,
            policy,
            outbound_rx,
            inbound_tx,
            status_tx,
            shutdown_rx,
        ));

        let handle = RelayHandle {
            outbound: outbound_tx,
            status: status_rx.clone(),
            shutdown: shutdown_tx,
        };
        (handle, inbound_rx, status_rx)
    }
}

enum PumpExit {
    ConnectionLost,
    Shutdown,
    SessionGone,
}

#[allow(clippy::too_many_arguments)]
async fn run_supervisor(
    url: String,
    room: String,
    username: String,
    policy: ReconnectPolicy,
    mut outbound: mpsc::UnboundedReceiver<RelayMessage>,
    inbound: mpsc::UnboundedSender<RelayMessage>,
    status: watch::Sender<RelayStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = policy.initial_delay;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                delay = policy.initial_delay;
                info!(%url, "relay connected");
                let _ = status.send(RelayStatus::Connected);

                match pump(stream, &room, &username, &mut outbound, &inbound, &mut shutdown).await
                {
                    PumpExit::ConnectionLost => {}
                    PumpExit::Shutdown | PumpExit::SessionGone => break,
                }
            }
            Err(e) => warn!(error = %e, "relay connect failed"),
        }

        if *shutdown.borrow() {
            break;
        }
        let _ = status.send(RelayStatus::Reconnecting);
        warn!(delay_ms = delay.as_millis() as u64, "relay connection lost, retrying");

        // While down, outbound traffic is dropped rather than queued.
        let wait = sleep(delay);
        tokio::pin!(wait);
        let cancelled = loop {
            tokio::select! {
                _ = &mut wait => break false,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break true;
                    }
                }
                msg = outbound.recv() => match msg {
                    Some(_) => debug!("relay not connected, dropping outbound message"),
                    None => break true,
                },
            }
        };
        if cancelled {
            break;
        }
        delay = policy.next_delay(delay);
    }

    let _ = status.send(RelayStatus::Closed);
    debug!("relay supervisor stopped");
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    room: &str,
    username: &str,
    outbound: &mut mpsc::UnboundedReceiver<RelayMessage>,
    inbound: &mpsc::UnboundedSender<RelayMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    let (mut write, mut read) = stream.split();

    // Every (re)connect re-announces the same credentials.
    let join = RelayMessage::Join {
        room: room.to_string(),
        username: username.to_string(),
    };
    match serde_json::to_string(&join) {
        Ok(json) => {
            if write.send(Message::Text(json)).await.is_err() {
                return PumpExit::ConnectionLost;
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to encode join message");
            return PumpExit::ConnectionLost;
        }
    }

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            }
            msg = outbound.recv() => match msg {
                Some(message) => match serde_json::to_string(&message) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            return PumpExit::ConnectionLost;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode relay message"),
                },
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::SessionGone;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(message) => {
                            if inbound.send(message).is_err() {
                                return PumpExit::SessionGone;
                            }
                        }
                        Err(e) => warn!(error = %e, "unparseable relay frame, skipping"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpExit::ConnectionLost,
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    warn!(error = %e, "relay read error");
                    return PumpExit::ConnectionLost;
                }
            },
        }
    }
}
