use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use url::Url;

use crate::config::LearnerConfig;
use crate::error::Result;
use crate::net::protocol::{ClientMessage, ServerMessage, session_url};
use crate::net::{Connector, Link, OUTBOUND_CAPACITY};
use crate::session::Inbox;

/// Connects to the live tutoring endpoint over a WebSocket.
pub struct WebSocketConnector {
    base_url: String,
}

impl WebSocketConnector {
    #[must_use]
    pub const fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Connector for WebSocketConnector {
    fn open(&mut self, learner: &LearnerConfig, link_id: u64, inbox: &Inbox) -> Result<Link> {
        let url = session_url(&self.base_url, learner)?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        tracing::info!("connecting to {url}");
        let task = tokio::spawn(run_link(url, link_id, inbox.clone(), outbound_rx));

        Ok(Link::new(link_id, outbound_tx, Some(task)))
    }
}

/// Drive one connection until either side closes it.
///
/// Every exit path reports `link_closed`, with an error description unless
/// the close was local or a normal close frame.
async fn run_link(
    url: Url,
    link_id: u64,
    inbox: Inbox,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
) {
    let stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            inbox.link_closed(link_id, Some(format!("failed to connect to {url}: {e}")));
            return;
        }
    };

    tracing::debug!("link {link_id} handshake complete");
    let (mut sink, mut source) = stream.split();
    let mut sent = 0u64;

    let error = loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        tracing::debug!("close frame not sent: {e}");
                    }
                    break None;
                };

                let json = match message.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("{e}");
                        continue;
                    }
                };

                if let Err(e) = sink.send(Message::Text(json)).await {
                    break Some(format!("send failed: {e}"));
                }
                sent += 1;
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match ServerMessage::parse(&text) {
                        Ok(message) => {
                            tracing::debug!("received {}", message.kind());
                            if !inbox.server_message(link_id, message) {
                                break None;
                            }
                        }
                        Err(e) => tracing::warn!("{e}"),
                    },
                    Some(Ok(Message::Close(frame))) => break close_error(frame.as_ref()),
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!("ignoring {} byte binary message", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(format!("connection error: {e}")),
                    None => break Some("connection dropped without a close frame".to_string()),
                }
            }
        }
    };

    tracing::debug!("link {link_id} finished after {sent} outbound messages");
    inbox.link_closed(link_id, error);
}

fn close_error(frame: Option<&CloseFrame<'_>>) -> Option<String> {
    match frame {
        None => None,
        Some(frame) if frame.code == CloseCode::Normal => None,
        Some(frame) => Some(format!(
            "server closed the connection ({}): {}",
            u16::from(frame.code),
            frame.reason
        )),
    }
}
