// Relay transport: one WebSocket per replica, exposed as a pair of channels.
//
// Abstracted via `RelayConnector` so the replica loop can be driven by an
// in-memory relay in tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use notesync_common::document::DocumentName;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

/// Close code reported when the socket dies without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Binary(Vec<u8>),
    Closed { code: u16, reason: String },
}

/// Outbound frames go in `outbound`; dropping it closes the connection.
pub struct FrameChannel {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),
    #[error("relay refused the connection with HTTP {0}")]
    Refused(u16),
    #[error("relay unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, document: &DocumentName, token: &str) -> Result<FrameChannel, ConnectError>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector {
    relay_url: Url,
}

impl WsConnector {
    pub fn new(relay_url: Url) -> Self {
        Self { relay_url }
    }

    /// `<relay>/note-<id>?token=<token>`.
    pub fn document_url(&self, document: &DocumentName, token: &str) -> Result<Url, ConnectError> {
        let mut url = self.relay_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConnectError::InvalidUrl(self.relay_url.to_string()))?
            .pop_if_empty()
            .push(&document.to_string());
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

#[async_trait]
impl RelayConnector for WsConnector {
    async fn connect(&self, document: &DocumentName, token: &str) -> Result<FrameChannel, ConnectError> {
        let url = self.document_url(document, token)?;
        let (socket, _) = connect_async(url.as_str()).await.map_err(|err| match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                ConnectError::Refused(response.status().as_u16())
            }
            other => ConnectError::Unreachable(other.to_string()),
        })?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (mut sink, mut stream) = socket.split();
        let document = document.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        let Some(frame) = outbound else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if sink.send(Message::binary(frame)).await.is_err() {
                            let _ = inbound_tx.send(RelayFrame::Closed {
                                code: ABNORMAL_CLOSE,
                                reason: "send failed".to_string(),
                            });
                            break;
                        }
                    }
                    inbound = stream.next() => {
                        match inbound {
                            Some(Ok(Message::Binary(data))) => {
                                let _ = inbound_tx.send(RelayFrame::Binary(data.to_vec()));
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let (code, reason) = frame
                                    .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                                    .unwrap_or((ABNORMAL_CLOSE, String::new()));
                                let _ = inbound_tx.send(RelayFrame::Closed { code, reason });
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                let _ = inbound_tx.send(RelayFrame::Closed {
                                    code: ABNORMAL_CLOSE,
                                    reason: err.to_string(),
                                });
                                break;
                            }
                            None => {
                                let _ = inbound_tx.send(RelayFrame::Closed {
                                    code: ABNORMAL_CLOSE,
                                    reason: "connection lost".to_string(),
                                });
                                break;
                            }
                        }
                    }
                }
            }
            debug!(%document, "relay socket closed");
        });

        Ok(FrameChannel { outbound: outbound_tx, inbound: inbound_rx })
    }
}
