//! Slave supervision.
//!
//! Each slave is a worker subprocess plus the state machine controlling
//! it. The supervisor owns the process handle and a single watchdog
//! deadline; every inbound event from the slave doubles as a heartbeat
//! that rearms the watchdog. Transitions are a total function over
//! `(state, event)`; invalid pairs are logged no-ops, never panics.
//!
//! ```text
//! unknown --heartbeat--> idle <--choke/invoke--> busy
//!    |                    |                        |
//!    +----- timeout ------+------ timeout ---------+--> dead
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};
use serde_json::Value;
use uuid::Uuid;

use kiln_common::config::{Manifest, Profile};
use kiln_common::error::Result;
use kiln_metrics::{CountGuard, SLAVES};

use crate::isolate::{Isolate, ProcessHandle};
use crate::job::{ErrorKind, Job};

/// Supervisor states. `Busy` implies a bound job; `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Spawned, awaiting the first heartbeat.
    Unknown,
    Idle,
    Busy,
    Dead,
}

/// Events delivered to a supervisor, either from the worker process or
/// from the engine.
#[derive(Debug)]
pub enum SlaveEvent {
    Heartbeat,
    Invoke(Job),
    Chunk(Value),
    Error { kind: ErrorKind, message: String },
    Choke,
    Terminate,
    Timeout,
}

/// The per-slave state machine.
pub struct SlaveSupervisor {
    id: Uuid,
    app: String,
    state: SlaveState,
    job: Option<Job>,
    handle: Option<Box<dyn ProcessHandle>>,
    deadline: Option<Instant>,
    spawned_at: Instant,
    profile: Profile,
    _count: CountGuard,
}

impl SlaveSupervisor {
    /// Spawns a worker process and arms the startup watchdog.
    pub fn spawn(
        app: &str,
        manifest: &Manifest,
        profile: &Profile,
        isolate: &dyn Isolate,
    ) -> Result<Self> {
        let id = Uuid::new_v4();

        let mut args = HashMap::new();
        args.insert("--app".to_string(), app.to_string());
        args.insert("--uuid".to_string(), id.to_string());

        tracing::debug!(app = %app, slave = %id, "spawning slave");
        let handle = isolate.spawn(&manifest.slave, &args)?;

        let now = Instant::now();
        Ok(Self {
            id,
            app: app.to_string(),
            state: SlaveState::Unknown,
            job: None,
            handle: Some(handle),
            deadline: Some(now + Duration::from_secs_f64(profile.startup_timeout)),
            spawned_at: now,
            profile: profile.clone(),
            _count: SLAVES.acquire(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SlaveState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlaveState::Idle
    }

    pub fn is_dead(&self) -> bool {
        self.state == SlaveState::Dead
    }

    /// The watchdog deadline, `None` once dead.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The event name of the bound job, `None` unless busy.
    pub fn job_event(&self) -> Option<&str> {
        self.job.as_ref().map(Job::event)
    }

    /// Delivers one event to the state machine.
    pub fn process(&mut self, event: SlaveEvent) {
        match (self.state, event) {
            (SlaveState::Dead, event) => {
                tracing::debug!(slave = %self.id, event = ?event, "event for a dead slave ignored");
            }

            (SlaveState::Unknown, SlaveEvent::Heartbeat) => {
                tracing::debug!(
                    slave = %self.id,
                    "slave came alive in {:.3} seconds",
                    self.spawned_at.elapsed().as_secs_f64()
                );
                self.state = SlaveState::Idle;
                self.rearm();
            }

            (SlaveState::Idle | SlaveState::Busy, SlaveEvent::Heartbeat) => {
                self.rearm();
            }

            (SlaveState::Idle, SlaveEvent::Invoke(job)) => {
                tracing::debug!(
                    app = %self.app,
                    slave = %self.id,
                    event = %job.event(),
                    "job assigned to slave"
                );
                self.job = Some(job);
                self.state = SlaveState::Busy;
                self.rearm();
            }

            (SlaveState::Busy, SlaveEvent::Chunk(value)) => {
                if let Some(job) = self.job.as_mut() {
                    job.process_chunk(value);
                }
                self.rearm();
            }

            (SlaveState::Busy, SlaveEvent::Error { kind, message }) => {
                if let Some(job) = self.job.as_mut() {
                    job.process_error(kind, message);
                }
                self.rearm();
            }

            (SlaveState::Busy, SlaveEvent::Choke) => {
                if let Some(mut job) = self.job.take() {
                    tracing::debug!(
                        app = %self.app,
                        slave = %self.id,
                        event = %job.event(),
                        "job completed by slave"
                    );
                    job.process_choke();
                }
                self.state = SlaveState::Idle;
                self.rearm();
            }

            (_, SlaveEvent::Timeout) => {
                tracing::error!(
                    slave = %self.id,
                    "slave didn't respond in a timely fashion"
                );
                if let Some(mut job) = self.job.take() {
                    tracing::debug!(
                        slave = %self.id,
                        event = %job.event(),
                        "dropping job due to a timeout"
                    );
                    job.process_error(ErrorKind::Timeout, "the job has timed out");
                    job.process_choke();
                }
                self.terminate();
            }

            (_, SlaveEvent::Terminate) => {
                self.terminate();
            }

            (state, event) => {
                tracing::warn!(
                    slave = %self.id,
                    state = ?state,
                    event = ?event,
                    "unexpected event for slave state, ignored"
                );
            }
        }
    }

    /// Kills the worker process and enters the dead state. A bound job is
    /// cancelled first so its request part is never lost.
    fn terminate(&mut self) {
        if let Some(mut job) = self.job.take() {
            job.process_error(ErrorKind::Server, "the job is being cancelled");
            job.process_choke();
        }

        if let Some(mut handle) = self.handle.take() {
            tracing::debug!(slave = %self.id, "reaping slave");
            handle.terminate();
        }

        self.deadline = None;
        self.state = SlaveState::Dead;
    }

    /// Rearms the watchdog: a busy job's own timeout when positive, the
    /// profile heartbeat timeout otherwise.
    fn rearm(&mut self) {
        let mut timeout = self.profile.heartbeat_timeout;
        if let Some(job) = &self.job {
            if job.policy().timeout > 0.0 {
                timeout = job.policy().timeout;
            }
        }

        tracing::trace!(
            slave = %self.id,
            timeout = timeout,
            "resetting slave heartbeat timeout"
        );
        self.deadline = Some(Instant::now() + Duration::from_secs_f64(timeout));
    }
}

impl Drop for SlaveSupervisor {
    fn drop(&mut self) {
        // Reaching destruction outside the dead state is a programming
        // error in the owning engine
        debug_assert!(
            self.state == SlaveState::Dead,
            "slave supervisor dropped while {:?}",
            self.state
        );
        if self.state != SlaveState::Dead {
            self.terminate();
        }
    }
}
