//! Locator collaborator.
//!
//! The relinker does not own connections; it hands every `(label,
//! endpoint)` pair to a [`Locator`] and moves on. Link attempts are
//! fire-and-forget, individual failures are ignored by design of the
//! relink loop.

use tokio::net::TcpStream;

pub trait Locator: Send + Sync {
    fn link(&self, label: &str, endpoint: &str);
}

/// Connect-and-forget TCP locator.
pub struct TcpLocator;

impl Locator for TcpLocator {
    fn link(&self, label: &str, endpoint: &str) {
        let label = label.to_string();
        let endpoint = endpoint.to_string();

        tokio::spawn(async move {
            match TcpStream::connect(&endpoint).await {
                Ok(_) => {
                    tracing::debug!(label = %label, endpoint = %endpoint, "linked peer");
                }
                Err(e) => {
                    tracing::debug!(
                        label = %label,
                        endpoint = %endpoint,
                        error = %e,
                        "link attempt failed"
                    );
                }
            }
        });
    }
}
