//! Kiln Event Core
//!
//! The single-threaded heart of the platform. One reactor task owns the
//! engine registry, the promise registry and the history buffers, and is
//! the only mutator of any of them. It demultiplexes client requests,
//! fans them out across engines, gathers per-target parts into composite
//! responses and replies once every part has arrived.
//!
//! # Main Components
//!
//! - [`Core`] - the reactor and its request dispatch
//! - [`Promise`] / [`PromiseRegistry`] - in-flight composite responses
//! - [`HistoryBuffer`] - bounded per-driver telemetry history
//! - [`Relinker`] - periodic cluster relink loop
//! - [`TaskStore`] / [`Locator`] - collaborator interfaces
//!
//! # Concurrency Model
//!
//! Work is offloaded to worker *processes* only. The sockets live in their
//! own tasks behind channels; every handler here runs on the reactor and
//! may freely mutate core state without locking.

pub mod dispatch;
pub mod history;
pub mod locator;
pub mod promise;
pub mod reactor;
pub mod relink;
pub mod storage;

pub use history::HistoryBuffer;
pub use locator::{Locator, TcpLocator};
pub use promise::{FulfillOutcome, Promise, PromiseRegistry, SealedResponse};
pub use reactor::{Collaborators, Core, CoreIo};
pub use relink::Relinker;
pub use storage::{MemoryStore, NullStore, TaskStore};
