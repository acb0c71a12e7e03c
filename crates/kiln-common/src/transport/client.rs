use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{KilnError, Result};
use crate::transport::frame::{read_multipart, write_multipart, Multipart};

/// Request/reply client for the router channel.
///
/// Connections are kept alive between requests; the router replies on the
/// connection the request arrived on.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| KilnError::Connection(format!("failed to connect to {addr}: {e}")))?;
        Ok(Self { stream })
    }

    /// Sends one request and waits for the composite response.
    pub async fn request(&mut self, payload: &Value, signature: Option<&[u8]>) -> Result<Value> {
        let mut body = vec![serde_json::to_vec(payload)?];
        if let Some(signature) = signature {
            body.push(signature.to_vec());
        }

        let message = Multipart::addressed(&[], body);
        write_multipart(&mut self.stream, &message).await?;

        let reply = read_multipart(&mut self.stream)
            .await?
            .ok_or_else(|| KilnError::Connection("connection closed by peer".to_string()))?;

        let (_, body) = reply.split_route()?;
        let body = body
            .first()
            .ok_or_else(|| KilnError::Transport("empty response body".to_string()))?;

        Ok(serde_json::from_slice(body)?)
    }
}

/// Subscriber client for the publisher channel.
pub struct Subscriber {
    stream: TcpStream,
}

impl Subscriber {
    /// Connects and subscribes to envelopes starting with `prefix`. An
    /// empty prefix subscribes to everything.
    pub async fn connect(addr: &str, prefix: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| KilnError::Connection(format!("failed to connect to {addr}: {e}")))?;

        stream
            .write_all(format!("{prefix}\n").as_bytes())
            .await
            .map_err(|e| KilnError::Connection(format!("failed to subscribe: {e}")))?;

        Ok(Self { stream })
    }

    /// Receives the next published event as `(envelope, blob)`.
    pub async fn recv(&mut self) -> Result<(String, Vec<u8>)> {
        let message = read_multipart(&mut self.stream)
            .await?
            .ok_or_else(|| KilnError::Connection("publisher closed".to_string()))?;

        let frames = message.frames();
        if frames.len() != 2 {
            return Err(KilnError::Transport(format!(
                "expected a two-frame publication, got {} frames",
                frames.len()
            )));
        }

        let envelope = String::from_utf8(frames[0].clone())
            .map_err(|e| KilnError::Transport(format!("invalid envelope: {e}")))?;
        Ok((envelope, frames[1].clone()))
    }
}
