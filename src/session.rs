use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audio::AudioCapture;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::links::PeerLinkManager;
use crate::media::{LinkEvent, LinkEventKind};
use crate::relay::{RelayHandle, RelayStatus, RelaySupervisor};
use crate::signaling::RelayMessage;
use crate::webrtc::RtcLinkFactory;

/// How often stalled negotiations are checked against the timeout.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// User-facing projection of the room, rendered by whoever drives the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomUpdate {
    Chat { from: String, content: String },
    Notice(String),
    Roster(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Chat(String),
    ToggleMute,
    Leave,
}

/// Everything the session can react to, routed through one dispatcher.
enum SessionEvent {
    Relay(RelayMessage),
    RelayStatus(RelayStatus),
    Link(LinkEvent),
    Command(SessionCommand),
    SweepTick,
}

/// Command side of a running session, for the UI / stdin loop.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn send(&self, command: SessionCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Top-level orchestration for one participant in one room: join/leave
/// lifecycle, chat relay, membership-driven link creation and teardown.
pub struct RoomSession {
    username: String,
    room: String,
    roster: BTreeSet<String>,
    links: PeerLinkManager,
    relay: RelayHandle,
    relay_inbound: mpsc::UnboundedReceiver<RelayMessage>,
    relay_status: watch::Receiver<RelayStatus>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    updates: mpsc::UnboundedSender<RoomUpdate>,
    capture: Option<AudioCapture>,
    negotiation_timeout: Duration,
    ended: bool,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("username", &self.username)
            .field("room", &self.room)
            .field("roster", &self.roster)
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    /// Validate the names, acquire the microphone, and start the relay
    /// supervisor. Microphone failure is fatal to joining; nothing network
    /// side happens on a validation error.
    pub fn join(
        config: &SessionConfig,
        username: &str,
        room: &str,
        updates: mpsc::UnboundedSender<RoomUpdate>,
    ) -> Result<(RoomSession, SessionHandle)> {
        let username = username.trim();
        let room = room.trim();
        if username.is_empty() || room.is_empty() {
            return Err(Error::InvalidInput(
                "username and room must both be non-empty".into(),
            ));
        }

        let factory = RtcLinkFactory::new(config)?;
        let capture = AudioCapture::start(factory.audio_track())?;

        let (relay, relay_inbound, relay_status) = RelaySupervisor::spawn(
            config.relay_url.clone(),
            room.to_string(),
            username.to_string(),
            config.reconnect.clone(),
        );

        let (link_tx, link_events) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        info!(room = %room, username = %username, "joining room");
        let session = RoomSession {
            username: username.to_string(),
            room: room.to_string(),
            roster: BTreeSet::new(),
            links: PeerLinkManager::new(Arc::new(factory), link_tx),
            relay,
            relay_inbound,
            relay_status,
            link_events,
            commands,
            updates,
            capture: Some(capture),
            negotiation_timeout: config.negotiation_timeout,
            ended: false,
        };
        Ok((session, SessionHandle { commands: command_tx }))
    }

    /// The session's event loop. Runs until the user leaves or the relay
    /// supervisor goes away, then tears everything down.
    pub async fn run(&mut self) {
        let mut sweep = interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await; // the first tick completes immediately

        loop {
            let event = tokio::select! {
                message = self.relay_inbound.recv() => match message {
                    Some(message) => SessionEvent::Relay(message),
                    None => break,
                },
                event = self.link_events.recv() => match event {
                    Some(event) => SessionEvent::Link(event),
                    None => break,
                },
                changed = self.relay_status.changed() => match changed {
                    Ok(()) => SessionEvent::RelayStatus(*self.relay_status.borrow_and_update()),
                    Err(_) => break,
                },
                command = self.commands.recv() => match command {
                    Some(command) => SessionEvent::Command(command),
                    // All command handles dropped: treat as leaving.
                    None => SessionEvent::Command(SessionCommand::Leave),
                },
                _ = sweep.tick() => SessionEvent::SweepTick,
            };

            let leaving = matches!(event, SessionEvent::Command(SessionCommand::Leave));
            self.dispatch(event).await;
            if leaving {
                break;
            }
        }

        self.end_call().await;
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Relay(message) => self.on_relay_message(message).await,
            SessionEvent::RelayStatus(status) => self.on_relay_status(status),
            SessionEvent::Link(event) => self.on_link_event(event).await,
            SessionEvent::Command(command) => self.on_command(command).await,
            SessionEvent::SweepTick => self.sweep_stalled_links().await,
        }
    }

    async fn on_relay_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Chat {
                username, content, ..
            } => {
                self.push_update(RoomUpdate::Chat {
                    from: username,
                    content,
                });
            }
            RelayMessage::UserJoined { username } => {
                if username == self.username {
                    return;
                }
                self.notice(format!("{username} joined the room"));
                if !self.roster.insert(username.clone()) {
                    // Names are the only identity the relay gives us; a rejoin
                    // under a live name aliases onto the existing link.
                    warn!(peer = %username, "join announced for a name already present");
                }
                self.push_roster();
                self.open_initiator_link(&username).await;
            }
            RelayMessage::UserList { content } => {
                let listed: Vec<String> = content
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
                self.roster = listed
                    .iter()
                    .filter(|name| **name != self.username)
                    .cloned()
                    .collect();
                self.push_roster();
                for name in &listed {
                    if *name != self.username && !self.links.contains(name) {
                        self.open_initiator_link(name).await;
                    }
                }
            }
            RelayMessage::UserLeft { username } => {
                self.roster.remove(&username);
                self.links.close_link(&username).await;
                self.notice(format!("{username} left the room"));
                self.push_roster();
            }
            RelayMessage::Signal {
                target,
                username,
                signal,
            } => {
                if target != self.username {
                    debug!(%target, "signal addressed to someone else, ignoring");
                    return;
                }
                self.links.handle_signal(&username, &signal).await;
            }
            RelayMessage::Join { .. } => {
                debug!("unexpected join frame from relay, ignoring");
            }
        }
    }

    fn on_relay_status(&mut self, status: RelayStatus) {
        match status {
            RelayStatus::Connected => self.notice("connected to the room relay".into()),
            RelayStatus::Reconnecting => {
                self.notice("connection lost, trying to reconnect...".into())
            }
            RelayStatus::Connecting | RelayStatus::Closed => {}
        }
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event.kind {
            LinkEventKind::SignalReady(payload) => match serde_json::to_string(&payload) {
                Ok(signal) => self.relay.send(RelayMessage::Signal {
                    target: event.peer,
                    username: self.username.clone(),
                    signal,
                }),
                Err(e) => warn!(error = %e, "failed to encode signal payload"),
            },
            LinkEventKind::Connected => {
                self.links.mark_connected(&event.peer);
                self.notice(format!("voice connected with {}", event.peer));
            }
            LinkEventKind::Failed => {
                warn!(peer = %event.peer, "peer link failed");
                self.links.close_link(&event.peer).await;
                self.notice(format!("voice connection with {} failed", event.peer));
            }
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Chat(content) => {
                let content = content.trim();
                if content.is_empty() {
                    return;
                }
                self.relay.send(RelayMessage::Chat {
                    room: self.room.clone(),
                    username: self.username.clone(),
                    content: content.to_string(),
                });
            }
            SessionCommand::ToggleMute => {
                if let Some(capture) = &self.capture {
                    let muted = capture.toggle_muted();
                    self.notice(
                        if muted {
                            "microphone muted"
                        } else {
                            "microphone live"
                        }
                        .into(),
                    );
                }
            }
            SessionCommand::Leave => self.end_call().await,
        }
    }

    /// Timeout-and-retry for negotiations that never completed: tear the link
    /// down and, if the peer is still in the room, call again.
    async fn sweep_stalled_links(&mut self) {
        for peer in self.links.stale_links(self.negotiation_timeout) {
            warn!(peer = %peer, "negotiation timed out, tearing down link");
            self.links.close_link(&peer).await;
            if self.roster.contains(&peer) {
                self.notice(format!("retrying call with {peer}"));
                self.open_initiator_link(&peer).await;
            }
        }
    }

    async fn open_initiator_link(&mut self, peer: &str) {
        if let Err(e) = self.links.create_link(peer, true).await {
            warn!(peer = %peer, error = %e, "failed to open peer link");
            self.notice(format!("could not start a call with {peer}"));
        }
    }

    /// Stop capture, close every link, cancel the relay supervisor, reset the
    /// projected state. Safe to call repeatedly and with nothing acquired.
    pub async fn end_call(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        info!(room = %self.room, "ending call");

        self.capture = None;
        self.links.close_all().await;
        self.relay.shutdown();
        self.roster.clear();
        self.push_roster();
        self.notice("call ended".into());
    }

    fn push_update(&self, update: RoomUpdate) {
        let _ = self.updates.send(update);
    }

    fn notice(&self, text: String) {
        self.push_update(RoomUpdate::Notice(text));
    }

    fn push_roster(&self) {
        self.push_update(RoomUpdate::Roster(self.roster.iter().cloned().collect()));
    }
}
