use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KilnError, Result};

/// Maximum total message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of frames per message.
pub const MAX_FRAMES: usize = 64;

/// An ordered sequence of byte frames.
///
/// Requests carry a reply route as leading identity frames, separated from
/// the body by one empty delimiter frame:
///
/// ```text
/// [id-1] ... [id-n] [] [payload] [signature]?
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Multipart {
    frames: Vec<Vec<u8>>,
}

impl Multipart {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn from_frames(frames: Vec<Vec<u8>>) -> Self {
        Self { frames }
    }

    /// Builds an addressed message: route frames, the empty delimiter, then
    /// the body frames.
    pub fn addressed(route: &[Vec<u8>], body: Vec<Vec<u8>>) -> Self {
        let mut frames = Vec::with_capacity(route.len() + 1 + body.len());
        frames.extend(route.iter().cloned());
        frames.push(Vec::new());
        frames.extend(body);
        Self { frames }
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Removes and returns the first frame.
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        if self.frames.is_empty() {
            None
        } else {
            Some(self.frames.remove(0))
        }
    }

    /// Prepends a frame, shifting the rest.
    pub fn push_front(&mut self, frame: Vec<u8>) {
        self.frames.insert(0, frame);
    }

    /// Splits the message at the empty delimiter frame into route and body.
    ///
    /// The delimiter itself is dropped. Fails when no delimiter is present.
    pub fn split_route(&self) -> Result<(&[Vec<u8>], &[Vec<u8>])> {
        let delimiter = self
            .frames
            .iter()
            .position(|frame| frame.is_empty())
            .ok_or_else(|| {
                KilnError::InvalidRequest("missing route delimiter".to_string())
            })?;

        Ok((&self.frames[..delimiter], &self.frames[delimiter + 1..]))
    }

    /// Encodes the message for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.frames.iter().map(|frame| 4 + frame.len()).sum();
        let mut buf = Vec::with_capacity(4 + payload);

        buf.extend_from_slice(&(self.frames.len() as u32).to_be_bytes());
        for frame in &self.frames {
            buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            buf.extend_from_slice(frame);
        }
        buf
    }
}

/// Reads one multipart message. Returns `None` on a clean end of stream.
pub async fn read_multipart<S>(stream: &mut S) -> Result<Option<Multipart>>
where
    S: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    match stream.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => {
            return Err(KilnError::Connection(format!(
                "failed to read frame count: {e}"
            )));
        }
    }

    let count = u32::from_be_bytes(count_buf) as usize;
    if count > MAX_FRAMES {
        return Err(KilnError::Transport(format!(
            "too many frames: {count} (max {MAX_FRAMES})"
        )));
    }

    let mut total = 0usize;
    let mut frames = Vec::with_capacity(count);

    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| KilnError::Connection(format!("failed to read frame length: {e}")))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        total += len;
        if total > MAX_MESSAGE_SIZE {
            return Err(KilnError::Transport(format!(
                "message too large: {total} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }

        let mut frame = vec![0u8; len];
        stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| KilnError::Connection(format!("failed to read frame: {e}")))?;
        frames.push(frame);
    }

    Ok(Some(Multipart::from_frames(frames)))
}

/// Writes one multipart message.
pub async fn write_multipart<S>(stream: &mut S, message: &Multipart) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&message.encode())
        .await
        .map_err(|e| KilnError::Connection(format!("failed to write message: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_codec_round_trip() {
        let message = Multipart::from_frames(vec![
            b"identity".to_vec(),
            Vec::new(),
            b"{\"action\":\"stats\"}".to_vec(),
        ]);

        let mut wire = std::io::Cursor::new(message.encode());
        let decoded = read_multipart(&mut wire).await.unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut wire = std::io::Cursor::new(Vec::new());
        assert!(read_multipart(&mut wire).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_message_is_an_error() {
        let message = Multipart::from_frames(vec![b"frame".to_vec()]);
        let mut encoded = message.encode();
        encoded.truncate(encoded.len() - 2);

        let mut wire = std::io::Cursor::new(encoded);
        assert!(read_multipart(&mut wire).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_count_limit() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&(MAX_FRAMES as u32 + 1).to_be_bytes());

        let mut wire = std::io::Cursor::new(encoded);
        assert!(read_multipart(&mut wire).await.is_err());
    }

    #[test]
    fn test_split_route() {
        let message = Multipart::from_frames(vec![
            b"a".to_vec(),
            b"b".to_vec(),
            Vec::new(),
            b"body".to_vec(),
            b"sig".to_vec(),
        ]);

        let (route, body) = message.split_route().unwrap();
        assert_eq!(route, &[b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(body, &[b"body".to_vec(), b"sig".to_vec()]);
    }

    #[test]
    fn test_split_route_empty_route() {
        let message = Multipart::from_frames(vec![Vec::new(), b"body".to_vec()]);
        let (route, body) = message.split_route().unwrap();
        assert!(route.is_empty());
        assert_eq!(body, &[b"body".to_vec()]);
    }

    #[test]
    fn test_split_route_missing_delimiter() {
        let message = Multipart::from_frames(vec![b"body".to_vec()]);
        assert!(message.split_route().is_err());
    }

    #[test]
    fn test_addressed() {
        let route = vec![b"client".to_vec()];
        let message = Multipart::addressed(&route, vec![b"body".to_vec()]);
        let (split_route, body) = message.split_route().unwrap();
        assert_eq!(split_route, route.as_slice());
        assert_eq!(body, &[b"body".to_vec()]);
    }
}
