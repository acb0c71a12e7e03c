use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use serde_json::{json, Value};
use uuid::Uuid;

use kiln_common::config::{Manifest, Profile};
use kiln_common::error::{KilnError, Result};
use kiln_metrics::{CountGuard, ENGINES};

use crate::isolate::Isolate;
use crate::job::{ErrorKind, Job};
use crate::pipes::{CorePipes, Fulfillment, ReapRequest};
use crate::slave::{SlaveEvent, SlaveState, SlaveSupervisor};

/// The worker pool for one named application.
///
/// Owns the slave supervisors and the backlog of jobs waiting for an idle
/// slave. Jobs fulfill their request part themselves through the futures
/// pipe; the engine only routes them.
pub struct Engine {
    name: String,
    manifest: Manifest,
    profile: Profile,
    isolate: Arc<dyn Isolate>,
    pipes: CorePipes,
    slaves: HashMap<Uuid, SlaveSupervisor>,
    queue: VecDeque<Job>,
    _count: CountGuard,
}

impl Engine {
    pub fn new(
        name: impl Into<String>,
        manifest: Manifest,
        profile: Profile,
        isolate: Arc<dyn Isolate>,
        pipes: CorePipes,
    ) -> Result<Self> {
        let name = name.into();

        if name.is_empty() {
            return Err(KilnError::Engine("empty application name".to_string()));
        }
        if manifest.slave.is_empty() {
            return Err(KilnError::Engine(
                "no slave image configured".to_string(),
            ));
        }

        tracing::info!(app = %name, "starting engine");
        Ok(Self {
            name,
            manifest,
            profile,
            isolate,
            pipes,
            slaves: HashMap::new(),
            queue: VecDeque::new(),
            _count: ENGINES.acquire(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues a job built from per-target request arguments and assigns
    /// it to an idle slave, spawning a new slave when none is idle and the
    /// pool ceiling allows.
    pub fn push(&mut self, future: &str, args: &Value) {
        let job = Job::from_args(args, future, &self.name, self.pipes.futures.clone());

        if let Some(slave) = self.slaves.values_mut().find(|slave| slave.is_idle()) {
            slave.process(SlaveEvent::Invoke(job));
            return;
        }

        if self.slaves.len() < self.profile.pool_limit {
            match SlaveSupervisor::spawn(&self.name, &self.manifest, &self.profile, &*self.isolate)
            {
                Ok(slave) => {
                    self.slaves.insert(slave.id(), slave);
                }
                Err(e) => {
                    tracing::error!(app = %self.name, error = %e, "failed to spawn a slave");
                    let mut job = job;
                    job.process_error(ErrorKind::Server, e.to_string());
                    job.process_choke();
                    return;
                }
            }
        }

        // Queued until a slave heartbeats into the idle state
        self.queue.push_back(job);
    }

    /// Drops jobs matching the `event` argument: queued jobs are cancelled
    /// outright, busy slaves running a match are terminated. The caller's
    /// part reports how many jobs were dropped.
    pub fn drop_job(&mut self, future: &str, args: &Value) {
        let event = args.get("event").and_then(Value::as_str).unwrap_or("");
        let mut dropped = 0;

        let mut queue = std::mem::take(&mut self.queue);
        for mut job in queue.drain(..) {
            if job.event() == event {
                job.process_error(ErrorKind::Server, "the job has been cancelled");
                job.process_choke();
                dropped += 1;
            } else {
                self.queue.push_back(job);
            }
        }

        let busy: Vec<Uuid> = self
            .slaves
            .values()
            .filter(|slave| slave.job_event() == Some(event))
            .map(SlaveSupervisor::id)
            .collect();
        for id in busy {
            // Terminating the slave cancels its job with a server error
            if let Some(slave) = self.slaves.get_mut(&id) {
                slave.process(SlaveEvent::Terminate);
                self.request_reap(id);
                dropped += 1;
            }
        }

        let result = if dropped > 0 {
            json!({"dropped": dropped})
        } else {
            tracing::error!(app = %self.name, event = %event, "no job found to drop");
            json!({"error": "job not found"})
        };

        let _ = self.pipes.futures.send(Fulfillment {
            future: future.to_string(),
            engine: self.name.clone(),
            result,
        });
    }

    /// Destroys a slave after it reached the dead state. When queued jobs
    /// are left behind, a replacement slave is spawned so the backlog
    /// cannot starve.
    pub fn reap(&mut self, slave: Uuid) {
        match self.slaves.get(&slave) {
            Some(supervisor) if supervisor.is_dead() => {
                self.slaves.remove(&slave);
                tracing::debug!(app = %self.name, slave = %slave, "slave reaped");
            }
            Some(_) => {
                tracing::warn!(app = %self.name, slave = %slave, "reap for a live slave ignored");
                return;
            }
            None => {
                tracing::error!(app = %self.name, slave = %slave, "found an orphan - unknown slave");
                return;
            }
        }

        if self.queue.is_empty() || self.slaves.len() >= self.profile.pool_limit {
            return;
        }

        match SlaveSupervisor::spawn(&self.name, &self.manifest, &self.profile, &*self.isolate) {
            Ok(replacement) => {
                self.slaves.insert(replacement.id(), replacement);
            }
            Err(e) => {
                tracing::error!(app = %self.name, error = %e, "failed to respawn a slave");
                for mut job in self.queue.drain(..) {
                    job.process_error(ErrorKind::Server, e.to_string());
                    job.process_choke();
                }
            }
        }
    }

    /// Routes one inbound event to the slave's state machine and reacts to
    /// the resulting state: dead slaves are scheduled for reaping, idle
    /// slaves pick up queued work.
    pub fn handle_slave_event(&mut self, slave: Uuid, event: SlaveEvent) {
        let state = match self.slaves.get_mut(&slave) {
            Some(supervisor) => {
                supervisor.process(event);
                supervisor.state()
            }
            None => {
                tracing::error!(app = %self.name, slave = %slave, "found an orphan - unknown slave");
                return;
            }
        };

        match state {
            SlaveState::Dead => self.request_reap(slave),
            SlaveState::Idle => self.pump(),
            _ => {}
        }
    }

    /// The earliest heartbeat deadline across the pool.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slaves
            .values()
            .filter_map(SlaveSupervisor::deadline)
            .min()
    }

    /// Fires the watchdog for every slave whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .slaves
            .values()
            .filter(|slave| slave.deadline().is_some_and(|deadline| deadline <= now))
            .map(SlaveSupervisor::id)
            .collect();

        for id in expired {
            self.handle_slave_event(id, SlaveEvent::Timeout);
        }
    }

    fn request_reap(&self, slave: Uuid) {
        let _ = self.pipes.reaper.send(ReapRequest {
            engine: self.name.clone(),
            slave,
        });
    }

    fn pump(&mut self) {
        while let Some(job) = self.queue.pop_front() {
            match self.slaves.values_mut().find(|slave| slave.is_idle()) {
                Some(slave) => slave.process(SlaveEvent::Invoke(job)),
                None => {
                    self.queue.push_front(job);
                    break;
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        tracing::info!(app = %self.name, "stopping engine");

        // Supervisors must reach the dead state before destruction; this
        // also cancels any job they are holding
        for slave in self.slaves.values_mut() {
            if !slave.is_dead() {
                slave.process(SlaveEvent::Terminate);
            }
        }

        for mut job in self.queue.drain(..) {
            job.process_error(ErrorKind::Server, "the job is being cancelled");
            job.process_choke();
        }
    }
}
