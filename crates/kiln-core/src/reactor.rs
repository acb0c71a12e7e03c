//! The event core run loop.
//!
//! One task, all the state. The loop multiplexes the inbound request
//! channel, the slave event channel, the three internal pipes (`events`,
//! `futures`, `reaper`), the process signals and the earliest slave
//! watchdog deadline. Handlers are synchronous and non-blocking; the
//! sockets live behind channels in their own tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kiln_common::auth::Verifier;
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_common::transport::publisher::Publication;
use kiln_common::transport::Multipart;
use kiln_engine::{
    CorePipes, Engine, Fulfillment, Isolate, ReapRequest, SlaveMessage, TelemetryEvent,
};

use crate::history::HistoryBuffer;
use crate::promise::{FulfillOutcome, PromiseRegistry};
use crate::storage::TaskStore;

/// Channel endpoints connecting the core to the socket layer and to the
/// slave event source.
pub struct CoreIo {
    /// Inbound requests, identity-prefixed by the router.
    pub requests: mpsc::UnboundedReceiver<Multipart>,
    /// Outbound replies, addressed by their leading identity frame.
    pub replies: mpsc::UnboundedSender<Multipart>,
    /// Outbound publications.
    pub publish: mpsc::UnboundedSender<Publication>,
    /// Inbound slave events.
    pub slaves: mpsc::UnboundedReceiver<SlaveMessage>,
    /// Inbound driver telemetry.
    pub events: mpsc::UnboundedReceiver<TelemetryEvent>,
}

/// The collaborator set the core delegates to.
pub struct Collaborators {
    pub storage: Arc<dyn TaskStore>,
    pub verifier: Arc<dyn Verifier>,
    pub isolate: Arc<dyn Isolate>,
}

/// The event core.
pub struct Core {
    pub(crate) config: Config,
    pub(crate) engines: HashMap<String, Engine>,
    pub(crate) promises: PromiseRegistry,
    pub(crate) history: HistoryBuffer,

    pub(crate) requests_rx: mpsc::UnboundedReceiver<Multipart>,
    pub(crate) replies_tx: mpsc::UnboundedSender<Multipart>,
    pub(crate) publish_tx: mpsc::UnboundedSender<Publication>,
    pub(crate) slaves_rx: mpsc::UnboundedReceiver<SlaveMessage>,
    pub(crate) events_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    pub(crate) futures_rx: mpsc::UnboundedReceiver<Fulfillment>,
    pub(crate) reaper_rx: mpsc::UnboundedReceiver<ReapRequest>,
    pub(crate) pipes: CorePipes,

    pub(crate) storage: Arc<dyn TaskStore>,
    pub(crate) verifier: Arc<dyn Verifier>,
    pub(crate) isolate: Arc<dyn Isolate>,

    pub(crate) shutdown: CancellationToken,
}

impl Core {
    pub fn new(
        config: Config,
        io: CoreIo,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> Self {
        let (futures_tx, futures_rx) = mpsc::unbounded_channel();
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let history = HistoryBuffer::new(config.core.history_depth);

        Self {
            config,
            engines: HashMap::new(),
            promises: PromiseRegistry::new(),
            history,
            requests_rx: io.requests,
            replies_tx: io.replies,
            publish_tx: io.publish,
            slaves_rx: io.slaves,
            events_rx: io.events,
            futures_rx,
            reaper_rx,
            pipes: CorePipes {
                futures: futures_tx,
                reaper: reaper_tx,
            },
            storage: collaborators.storage,
            verifier: collaborators.verifier,
            isolate: collaborators.isolate,
            shutdown,
        }
    }

    /// Runs the reactor until a stop signal arrives or the shutdown token
    /// fires.
    pub async fn run(mut self) -> Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        self.recover();

        loop {
            let deadline = self.next_slave_deadline();
            let wake = tokio::time::Instant::from_std(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sigquit.recv() => break,

                _ = sighup.recv() => self.reload(),
                _ = sigusr1.recv() => self.purge(),

                Some(message) = self.requests_rx.recv() => self.handle_request(message),
                Some(message) = self.slaves_rx.recv() => self.handle_slave_message(message),
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(fulfillment) = self.futures_rx.recv() => self.handle_fulfillment(fulfillment),
                Some(reap) = self.reaper_rx.recv() => self.handle_reap(reap),

                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.expire_slaves();
                }

                else => break,
            }
        }

        tracing::info!("shutting down the engines");
        self.engines.clear();
        Ok(())
    }

    /// Clears all in-flight state and reinstates persisted tasks. Slaves
    /// of dropped engines are terminated; their late fulfillments become
    /// logged orphans.
    pub fn reload(&mut self) {
        tracing::info!("reloading tasks");

        self.promises.clear();
        self.engines.clear();
        self.history.clear();

        self.recover();
    }

    /// Reload, plus erases the persistence collaborator's state.
    pub fn purge(&mut self) {
        tracing::info!("purging tasks");

        self.promises.clear();
        self.engines.clear();
        self.history.clear();

        if let Err(e) = self.storage.purge() {
            tracing::error!(error = %e, "failed to purge the task store");
        }
    }

    /// Routes one slave event to its engine.
    pub(crate) fn handle_slave_message(&mut self, message: SlaveMessage) {
        match self.engines.get_mut(&message.engine) {
            Some(engine) => engine.handle_slave_event(message.slave, message.event),
            None => {
                tracing::error!(engine = %message.engine, "found an orphan - unknown engine");
            }
        }
    }

    /// Publishes driver telemetry and records it in the history.
    pub(crate) fn handle_event(&mut self, event: TelemetryEvent) {
        let now = reactor_time();

        if self.history.enabled() {
            self.history.record(&event.driver, now, &event.fields);
        }

        // Not JSON: a flat envelope keeps subscription-prefix filtering
        // possible on the subscriber side
        for (field, blob) in &event.fields {
            let envelope = format!("{} {} {:.3}", event.driver, field, now);
            let _ = self.publish_tx.send((envelope, blob.clone()));
        }
    }

    /// Applies one fulfillment from the futures pipe.
    pub(crate) fn handle_fulfillment(&mut self, fulfillment: Fulfillment) {
        let Fulfillment {
            future,
            engine,
            result,
        } = fulfillment;
        self.fulfill(&future, &engine, result);
    }

    /// Destroys a slave that reached the dead state.
    pub(crate) fn handle_reap(&mut self, reap: ReapRequest) {
        match self.engines.get_mut(&reap.engine) {
            Some(engine) => {
                tracing::debug!(engine = %reap.engine, slave = %reap.slave, "suicide requested");
                engine.reap(reap.slave);
            }
            None => {
                tracing::error!(engine = %reap.engine, "found an orphan - unknown engine");
            }
        }
    }

    /// Inserts one part into a promise, emitting the sealed response when
    /// it was the last one.
    pub(crate) fn fulfill(&mut self, id: &str, name: &str, value: serde_json::Value) {
        match self.promises.fulfill(id, name, value) {
            FulfillOutcome::Pending => {}
            FulfillOutcome::Sealed(sealed) => {
                if sealed.route.is_empty() {
                    // Recovery-owned promise, nothing to reply to
                    tracing::debug!("discarding an internal response");
                    return;
                }

                let body = match serde_json::to_vec(&sealed.body) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize a response");
                        return;
                    }
                };
                let _ = self
                    .replies_tx
                    .send(Multipart::addressed(&sealed.route, vec![body]));
            }
            FulfillOutcome::Orphan => {
                tracing::error!(future = %id, part = %name, "found an orphan - slice for future");
            }
        }
    }

    /// The earliest watchdog deadline across all engines.
    pub(crate) fn next_slave_deadline(&self) -> Option<Instant> {
        self.engines.values().filter_map(Engine::next_deadline).min()
    }

    /// Fires watchdogs for every slave past its deadline.
    pub(crate) fn expire_slaves(&mut self) {
        let now = Instant::now();
        for engine in self.engines.values_mut() {
            engine.expire(now);
        }
    }
}

/// Reactor wall-clock time in seconds, as published in event envelopes.
pub(crate) fn reactor_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
