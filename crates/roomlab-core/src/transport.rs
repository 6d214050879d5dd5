//! Native WebSocket transport for the collaboration channel.
//!
//! Runs the blocking socket on a background thread and exchanges commands
//! and events over channels, so the single-threaded editor loop stays
//! non-blocking and polls with [`ChannelClient::poll_events`].

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tungstenite::{connect, Message};
use url::Url;

use crate::protocol::RoomMessage;

/// Commands sent to the socket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// What the socket thread reports back, drained via `poll_events`.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Received(RoomMessage),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// WebSocket client for native platforms.
pub struct ChannelClient {
    state: ChannelState,
    cmd_tx: Option<Sender<WsCommand>>,
    event_rx: Option<Receiver<ChannelEvent>>,
    _thread: Option<JoinHandle<()>>,
}

impl ChannelClient {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Disconnected,
            cmd_tx: None,
            event_rx: None,
            _thread: None,
        }
    }

    /// Open the channel. Failure here leaves the session local-only.
    pub fn connect(&mut self, url: &str) -> Result<(), String> {
        if self.cmd_tx.is_some() {
            return Err("already connected".to_string());
        }

        let parsed = Url::parse(url).map_err(|e| format!("invalid URL: {e}"))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(format!("invalid WebSocket scheme: {}", parsed.scheme()));
        }

        self.state = ChannelState::Connecting;

        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<ChannelEvent>();
        let url = url.to_string();

        let handle = thread::spawn(move || {
            log::info!("channel thread: connecting to {url}");
            match connect(url.as_str()) {
                Ok((mut socket, response)) => {
                    log::info!("channel connected, status: {}", response.status());
                    let _ = event_tx.send(ChannelEvent::Opened);

                    // Short read timeout keeps the command poll responsive.
                    if let tungstenite::stream::MaybeTlsStream::Plain(tcp) = socket.get_mut() {
                        let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                        let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
                    }

                    loop {
                        match cmd_rx.try_recv() {
                            Ok(WsCommand::Send(text)) => {
                                if let Err(e) = socket.send(Message::Text(text)) {
                                    log::error!("channel send error: {e}");
                                    break;
                                }
                            }
                            Ok(WsCommand::Close) => {
                                let _ = socket.close(None);
                                break;
                            }
                            Err(TryRecvError::Disconnected) => break,
                            Err(TryRecvError::Empty) => {}
                        }

                        match socket.read() {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<RoomMessage>(&text) {
                                    Ok(message) => {
                                        let _ = event_tx.send(ChannelEvent::Received(message));
                                    }
                                    Err(e) => {
                                        log::warn!("unparseable channel message: {e}");
                                    }
                                }
                            }
                            Ok(Message::Ping(data)) => {
                                let _ = socket.send(Message::Pong(data));
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(tungstenite::Error::Io(ref e))
                                if e.kind() == std::io::ErrorKind::WouldBlock
                                    || e.kind() == std::io::ErrorKind::TimedOut =>
                            {
                                continue;
                            }
                            Err(e) => {
                                log::error!("channel read error: {e}");
                                break;
                            }
                        }
                    }

                    let _ = event_tx.send(ChannelEvent::Closed);
                }
                Err(e) => {
                    log::warn!("channel connect failed: {e}");
                    let _ = event_tx.send(ChannelEvent::Error(e.to_string()));
                    let _ = event_tx.send(ChannelEvent::Closed);
                }
            }
        });

        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.event_rx = None;
        self.state = ChannelState::Disconnected;
    }

    /// Queue a message on the socket thread. Fire-and-forget.
    pub fn send(&self, message: &RoomMessage) -> Result<(), String> {
        let tx = self.cmd_tx.as_ref().ok_or("not connected")?;
        let text = serde_json::to_string(message).map_err(|e| e.to_string())?;
        tx.send(WsCommand::Send(text)).map_err(|e| e.to_string())
    }

    /// Drain pending events, updating the connection state.
    pub fn poll_events(&mut self) -> Vec<ChannelEvent> {
        let Some(rx) = &self.event_rx else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match &event {
                ChannelEvent::Opened => self.state = ChannelState::Connected,
                ChannelEvent::Closed => self.state = ChannelState::Disconnected,
                ChannelEvent::Error(_) => self.state = ChannelState::Failed,
                ChannelEvent::Received(_) => {}
            }
            events.push(event);
        }
        events
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }
}

impl Default for ChannelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_urls() {
        let mut client = ChannelClient::new();
        assert!(client.connect("not a url").is_err());
        assert!(client.connect("http://example.com").is_err());
        assert_eq!(client.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_send_requires_connection() {
        let client = ChannelClient::new();
        let message = RoomMessage::JoinRoom {
            room_id: "room-1".into(),
        };
        assert!(client.send(&message).is_err());
    }

    #[test]
    fn test_poll_without_connection_is_empty() {
        let mut client = ChannelClient::new();
        assert!(client.poll_events().is_empty());
    }
}
