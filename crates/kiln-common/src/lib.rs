//! Kiln Common Types and Transport
//!
//! This crate provides the shared protocol definitions, multipart framing and
//! TCP transport layer for the Kiln application-worker orchestration platform.
//!
//! # Overview
//!
//! Kiln runs named jobs against named applications by dispatching them to
//! managed worker processes. This crate contains the infrastructure shared by
//! the core, the engines and the command-line client:
//!
//! - **Protocol Layer**: client payload schema, recovery task records
//! - **Transport Layer**: multipart framing, router and publisher channels
//! - **Auth**: the signing verifier collaborator
//! - **Config**: the platform configuration tree
//!
//! # Wire Format
//!
//! Messages are multipart: a sequence of byte frames. On the wire each
//! message is `[4-byte frame count] + ([4-byte length] + [bytes])*`, all
//! integers u32 big-endian. Client requests carry their reply route as
//! leading identity frames separated from the body by one empty frame.

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::Config;
pub use error::{KilnError, Result};
