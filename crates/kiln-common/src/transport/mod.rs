//! Kiln Transport Layer
//!
//! Framed multipart messaging over TCP.
//!
//! # Components
//!
//! - **[`Multipart`]**: an ordered sequence of byte frames plus the wire
//!   codec (`[u32 frame count] + ([u32 len] + [bytes])*`, big-endian)
//! - **[`RouterChannel`]**: the request/reply server. Every accepted
//!   connection is assigned an identity frame; inbound messages reach the
//!   core with the identity prepended, outbound messages are routed to the
//!   connection named by their leading identity frame.
//! - **[`PubChannel`]**: the one-way event publisher with per-subscriber
//!   prefix filtering and a sender-side drop discipline at the configured
//!   high-water mark.
//! - **[`Client`]** / **[`Subscriber`]**: the matching client endpoints.
//!
//! # Message Size Limits
//!
//! Messages are capped at 16 MiB and 64 frames to bound memory usage per
//! connection.

pub mod client;
pub mod frame;
pub mod publisher;
pub mod router;

pub use client::{Client, Subscriber};
pub use frame::{read_multipart, write_multipart, Multipart};
pub use publisher::PubChannel;
pub use router::RouterChannel;
