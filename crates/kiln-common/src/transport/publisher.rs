use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{KilnError, Result};
use crate::transport::frame::{write_multipart, Multipart};

/// One published event: the envelope string and the raw blob.
pub type Publication = (String, Vec<u8>);

/// The one-way event publisher.
///
/// Subscribers connect, send a single newline-terminated subscription
/// prefix (an empty line subscribes to everything) and then receive every
/// event whose envelope starts with that prefix as a two-frame message.
///
/// Each subscriber gets a bounded queue of `watermark` messages. A slow
/// subscriber does not stall the core: events beyond the watermark are
/// dropped on the sender side.
pub struct PubChannel {
    listeners: Vec<TcpListener>,
    watermark: usize,
}

impl PubChannel {
    pub async fn bind(endpoints: &[String], watermark: usize) -> Result<Self> {
        let mut listeners = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let listener = TcpListener::bind(endpoint).await.map_err(|e| {
                KilnError::Connection(format!("failed to bind publisher on {endpoint}: {e}"))
            })?;
            tracing::info!(endpoint = %endpoint, "publishing events");
            listeners.push(listener);
        }

        Ok(Self {
            listeners,
            watermark,
        })
    }

    pub fn local_addrs(&self) -> Result<Vec<std::net::SocketAddr>> {
        self.listeners
            .iter()
            .map(|listener| {
                listener
                    .local_addr()
                    .map_err(|e| KilnError::Connection(format!("failed to get local addr: {e}")))
            })
            .collect()
    }

    /// Spawns the accept and fan-out tasks, returning the publish sender.
    pub fn spawn(self, shutdown: CancellationToken) -> mpsc::UnboundedSender<Publication> {
        let (publish_tx, mut publish_rx) = mpsc::unbounded_channel::<Publication>();
        let (register_tx, mut register_rx) =
            mpsc::unbounded_channel::<(String, mpsc::Sender<Publication>)>();
        let watermark = self.watermark;

        for listener in self.listeners {
            let register_tx = register_tx.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, peer)) = accepted else { continue };
                            let register_tx = register_tx.clone();

                            tokio::spawn(async move {
                                let mut reader = BufReader::new(stream);
                                let mut prefix = String::new();
                                if reader.read_line(&mut prefix).await.is_err() {
                                    return;
                                }
                                let prefix = prefix.trim_end_matches('\n').to_string();
                                tracing::debug!(peer = %peer, prefix = %prefix, "subscriber connected");

                                let (queue_tx, mut queue_rx) =
                                    mpsc::channel::<Publication>(watermark.max(1));
                                if register_tx.send((prefix, queue_tx)).is_err() {
                                    return;
                                }

                                let mut stream = reader.into_inner();
                                while let Some((envelope, blob)) = queue_rx.recv().await {
                                    let message = Multipart::from_frames(vec![
                                        envelope.into_bytes(),
                                        blob,
                                    ]);
                                    if write_multipart(&mut stream, &message).await.is_err() {
                                        break;
                                    }
                                }
                            });
                        }
                    }
                }
            });
        }

        // Fan-out: filter by prefix, drop on a full subscriber queue
        tokio::spawn(async move {
            let mut subscribers: Vec<(String, mpsc::Sender<Publication>)> = Vec::new();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    registered = register_rx.recv() => {
                        match registered {
                            Some(subscriber) => subscribers.push(subscriber),
                            None => break,
                        }
                    }
                    published = publish_rx.recv() => {
                        let Some((envelope, blob)) = published else { break };

                        subscribers.retain(|(prefix, queue)| {
                            if !envelope.starts_with(prefix.as_str()) {
                                return !queue.is_closed();
                            }
                            match queue.try_send((envelope.clone(), blob.clone())) {
                                Ok(()) => true,
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    tracing::debug!("subscriber at watermark, dropping event");
                                    true
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => false,
                            }
                        });
                    }
                }
            }
        });

        publish_tx
    }
}
