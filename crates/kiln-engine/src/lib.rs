//! Kiln Engines
//!
//! An engine is the worker pool for one named application. It owns a set of
//! slave supervisors, routes jobs to idle slaves, queues what cannot run
//! yet, and surfaces slave lifecycle events upward through the core's
//! internal pipes.
//!
//! # Main Components
//!
//! - [`Engine`] - a per-application pool of supervised worker processes
//! - [`SlaveSupervisor`] - the per-slave state machine and watchdog
//! - [`Job`] - one unit of work bound to a composite request part
//! - [`Isolate`] - the process isolation collaborator
//!
//! # Ownership
//!
//! Engines are owned exclusively by the event core and mutated only on the
//! reactor task. Work is offloaded to worker *processes*, never to peer
//! threads; everything in this crate is single-threaded state.

pub mod engine;
pub mod isolate;
pub mod job;
pub mod pipes;
pub mod slave;

pub use engine::Engine;
pub use isolate::{Isolate, ProcessHandle, ProcessIsolate};
pub use job::{ErrorKind, Job, JobPolicy};
pub use pipes::{CorePipes, Fulfillment, ReapRequest, SlaveMessage, TelemetryEvent};
pub use slave::{SlaveEvent, SlaveState, SlaveSupervisor};
