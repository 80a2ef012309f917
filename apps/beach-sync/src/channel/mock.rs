use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{ChannelError, StreamConnection, StreamConnector};

/// Scripted result for the next connection attempt.
#[derive(Debug, Clone)]
pub enum MockConnect {
    Accept,
    Refuse(String),
    /// Never completes; exercises the connect timeout.
    Hang,
}

/// Remote side of an accepted in-memory connection.
pub struct MockPeer {
    pub url: Url,
    pub protocols: Vec<String>,
    to_client: Option<mpsc::UnboundedSender<Bytes>>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
}

impl MockPeer {
    pub fn push(&self, frame: impl Into<Bytes>) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(frame.into()).is_ok())
            .unwrap_or(false)
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.from_client.try_recv().ok()
    }

    /// Drops the server half so the client sees the stream end.
    pub fn hang_up(&mut self) {
        self.to_client.take();
    }
}

/// In-memory [`StreamConnector`] for tests. Attempts follow the scripted
/// queue and accept once it runs dry; every accepted peer is handed out
/// through [`MockConnector::peers`].
pub struct MockConnector {
    script: Mutex<VecDeque<MockConnect>>,
    attempts: Mutex<Vec<(Url, Vec<String>)>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: Mutex<Option<mpsc::UnboundedReceiver<MockPeer>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: impl IntoIterator<Item = MockConnect>) -> Arc<Self> {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: Mutex::new(Some(peers_rx)),
        })
    }

    /// Receiver of accepted peers. Can be taken once.
    pub fn peers(&self) -> Option<mpsc::UnboundedReceiver<MockPeer>> {
        self.peers_rx.lock().take()
    }

    pub fn attempts(&self) -> Vec<(Url, Vec<String>)> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(
        &self,
        url: &Url,
        protocols: &[String],
    ) -> Result<StreamConnection, ChannelError> {
        self.attempts.lock().push((url.clone(), protocols.to_vec()));
        let next = self.script.lock().pop_front().unwrap_or(MockConnect::Accept);
        match next {
            MockConnect::Accept => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.peers_tx.send(MockPeer {
                    url: url.clone(),
                    protocols: protocols.to_vec(),
                    to_client: Some(to_client),
                    from_client,
                });
                Ok(StreamConnection { outbound, inbound })
            }
            MockConnect::Refuse(reason) => Err(ChannelError::Connect(reason)),
            MockConnect::Hang => std::future::pending().await,
        }
    }
}
