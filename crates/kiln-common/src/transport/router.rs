use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{KilnError, Result};
use crate::transport::frame::{read_multipart, write_multipart, Multipart};

type ConnectionMap = Arc<Mutex<HashMap<Vec<u8>, mpsc::UnboundedSender<Multipart>>>>;

/// The request/reply server.
///
/// Emulates an identity-routing socket over TCP: every accepted connection
/// is assigned a fresh identity frame. Inbound messages are forwarded to
/// the core with the identity prepended to their route; outbound messages
/// are delivered to the connection named by their leading frame, which is
/// stripped before hitting the wire. Replies for connections that have
/// since disconnected are logged and dropped.
pub struct RouterChannel {
    listeners: Vec<TcpListener>,
}

/// Channel pair connecting the router to the event core.
pub struct RouterHandles {
    /// Inbound requests, identity-prefixed.
    pub requests: mpsc::UnboundedReceiver<Multipart>,
    /// Outbound replies, addressed by their leading identity frame.
    pub replies: mpsc::UnboundedSender<Multipart>,
}

impl RouterChannel {
    /// Binds the router on every configured endpoint.
    pub async fn bind(endpoints: &[String]) -> Result<Self> {
        let mut listeners = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let listener = TcpListener::bind(endpoint).await.map_err(|e| {
                KilnError::Connection(format!("failed to bind router on {endpoint}: {e}"))
            })?;
            tracing::info!(endpoint = %endpoint, "listening for requests");
            listeners.push(listener);
        }

        Ok(Self { listeners })
    }

    /// Bound addresses, for tests binding port zero.
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

    /// Spawns the accept and dispatch tasks, returning the core-side
    /// channel pair.
    pub fn spawn(self, shutdown: CancellationToken) -> RouterHandles {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));

        for listener in self.listeners {
            let requests_tx = requests_tx.clone();
            let connections = connections.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    tracing::debug!(peer = %peer, "connection established");
                                    handle_connection(
                                        stream,
                                        requests_tx.clone(),
                                        connections.clone(),
                                        shutdown.clone(),
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "failed to accept connection");
                                }
                            }
                        }
                    }
                }
            });
        }

        tokio::spawn(dispatch_replies(replies_rx, connections, shutdown));

        RouterHandles {
            requests: requests_rx,
            replies: replies_tx,
        }
    }
}

/// Splits a connection into a reader feeding the core and a writer drained
/// from the dispatch task. The connection is registered before the reader
/// starts, so a reply can never race its own request's registration.
async fn handle_connection(
    stream: TcpStream,
    requests_tx: mpsc::UnboundedSender<Multipart>,
    connections: ConnectionMap,
    shutdown: CancellationToken,
) {
    let identity = Uuid::new_v4().as_bytes().to_vec();
    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Multipart>();

    connections
        .lock()
        .await
        .insert(identity.clone(), writer_tx);

    // Reader: identity-prefix every inbound message
    {
        let identity = identity.clone();
        let connections = connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = read_multipart(&mut read_half) => {
                        match message {
                            Ok(Some(mut message)) => {
                                message.push_front(identity.clone());
                                if requests_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "dropping connection");
                                break;
                            }
                        }
                    }
                }
            }
            connections.lock().await.remove(&identity);
        });
    }

    // Writer: drain routed replies onto the wire
    tokio::spawn(async move {
        while let Some(message) = writer_rx.recv().await {
            if let Err(e) = write_multipart(&mut write_half, &message).await {
                tracing::warn!(error = %e, "failed to write reply");
                break;
            }
        }
    });
}

/// Routes outbound messages to their connection by leading identity frame.
async fn dispatch_replies(
    mut replies_rx: mpsc::UnboundedReceiver<Multipart>,
    connections: ConnectionMap,
    shutdown: CancellationToken,
) {
    loop {
        let mut message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = replies_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(identity) = message.pop_front() else {
            tracing::error!("unroutable reply: no identity frame");
            continue;
        };

        let writer = connections.lock().await.get(&identity).cloned();
        match writer {
            Some(writer) => {
                // Disconnects race with replies; a closed writer is not fatal
                let _ = writer.send(message);
            }
            None => {
                tracing::warn!("unroutable reply: peer disconnected");
            }
        }
    }
}
