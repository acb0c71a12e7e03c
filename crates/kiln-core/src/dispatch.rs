//! Request parsing and dispatch.
//!
//! Every client request gets a promise before anything else, so any
//! failure from here on (parse errors, protocol violations, signature
//! rejections, engine construction failures) lands as a part on that
//! promise and reaches the client. Only catastrophic invariant violations
//! are allowed to escape.

use serde_json::{json, Value};

use kiln_common::error::KilnError;
use kiln_common::protocol::ClientPayload;
use kiln_common::transport::Multipart;
use kiln_engine::Engine;
use kiln_metrics::{ENGINES, REQUESTS, SLAVES};

use crate::promise::Promise;
use crate::reactor::Core;

impl Core {
    /// Handles one inbound request message.
    pub(crate) fn handle_request(&mut self, message: Multipart) {
        let (route, body) = match message.split_route() {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, "malformed request, no reply possible");
                return;
            }
        };
        let payload = body.first().cloned().unwrap_or_default();
        let signature = body.get(1).cloned().unwrap_or_default();

        let promise = Promise::new(route.to_vec());
        let id = promise.id().to_string();
        self.promises.insert(promise);

        match ClientPayload::parse(&payload) {
            Ok(request) => {
                if let Err(message) = self.validate(&id, &request, &payload, &signature) {
                    tracing::error!(error = %message, "invalid request");
                    self.fulfill(&id, "error", Value::String(message));
                }
            }
            Err(e) => {
                let message = client_message(e);
                tracing::error!(error = %message, "invalid json");
                self.fulfill(&id, "error", Value::String(message));
            }
        }
    }

    /// Protocol validation, then dispatch. The error string becomes the
    /// request's `error` part verbatim.
    fn validate(
        &mut self,
        id: &str,
        request: &ClientPayload,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<(), String> {
        let version = request.version();
        if version < self.config.core.protocol {
            return Err("outdated protocol version".to_string());
        }
        self.promises.set_meta(id, "protocol", &version.to_string());

        let token = request.token();
        if token.is_empty() {
            return Err("security token expected".to_string());
        }
        self.promises.set_meta(id, "token", token);

        if version > 2 {
            self.verifier
                .verify(payload, signature, token)
                .map_err(|e| e.to_string())?;
        }

        self.dispatch(id, request)
    }

    fn dispatch(&mut self, id: &str, request: &ClientPayload) -> Result<(), String> {
        match request.action() {
            action @ ("push" | "drop") => self.dispatch_targets(id, action, request),
            "history" if self.history.enabled() => self.dispatch_targets(id, "history", request),
            "stats" => {
                self.stat(id);
                Ok(())
            }
            _ => Err("unsupported action".to_string()),
        }
    }

    /// Fans one request out across its targets. The promise awaits one
    /// part per target key; a target with non-object arguments fails alone
    /// without sinking its siblings.
    fn dispatch_targets(
        &mut self,
        id: &str,
        action: &str,
        request: &ClientPayload,
    ) -> Result<(), String> {
        let targets = match request.targets() {
            Some(targets) if !targets.is_empty() => targets,
            _ => return Err("no targets specified".to_string()),
        };

        self.promises.await_parts(id, targets.len());

        for (target, args) in targets {
            if !args.is_object() {
                tracing::error!(target = %target, "invalid request - target arguments expected");
                self.fulfill(id, target, json!({"error": "target arguments expected"}));
                continue;
            }

            match action {
                "push" => self.push(id, target, args),
                "drop" => self.drop_target(id, target, args),
                _ => self.history_target(id, target, args),
            }
        }

        Ok(())
    }

    /// Routes a job to the target's engine, constructing the engine on
    /// first use.
    pub(crate) fn push(&mut self, id: &str, target: &str, args: &Value) {
        if !self.engines.contains_key(target) {
            let engine = Engine::new(
                target,
                self.config.manifest.clone(),
                self.config.profile.clone(),
                self.isolate.clone(),
                self.pipes.clone(),
            );

            match engine {
                Ok(engine) => {
                    self.engines.insert(target.to_string(), engine);
                }
                Err(e) => {
                    tracing::error!(target = %target, error = %e, "failed to start an engine");
                    self.fulfill(id, target, json!({"error": e.to_string()}));
                    return;
                }
            }
        }

        if let Some(engine) = self.engines.get_mut(target) {
            engine.push(id, args);
        }
    }

    fn drop_target(&mut self, id: &str, target: &str, args: &Value) {
        match self.engines.get_mut(target) {
            Some(engine) => engine.drop_job(id, args),
            None => {
                tracing::error!(target = %target, "engine not found");
                self.fulfill(id, target, json!({"error": "engine not found"}));
            }
        }
    }

    fn history_target(&mut self, id: &str, target: &str, args: &Value) {
        let depth = args
            .get("depth")
            .and_then(Value::as_u64)
            .map(|depth| depth as usize)
            .unwrap_or_else(|| self.history.depth());

        match self.history.query(target, depth) {
            Some(result) => self.fulfill(id, target, result),
            None => {
                self.fulfill(id, target, json!({"error": "history is empty"}));
            }
        }
    }

    /// The `stats` action: three parts from the process-wide counters.
    fn stat(&mut self, id: &str) {
        self.promises.await_parts(id, 3);

        let list: Vec<String> = self.engines.keys().cloned().collect();
        let engines = ENGINES.snapshot();
        self.fulfill(
            id,
            "engines",
            json!({
                "list": list,
                "total": engines.total,
                "alive": engines.alive,
            }),
        );

        let slaves = SLAVES.snapshot();
        self.fulfill(
            id,
            "threads",
            json!({"total": slaves.total, "alive": slaves.alive}),
        );

        let requests = REQUESTS.snapshot();
        self.fulfill(
            id,
            "requests",
            json!({"total": requests.total, "pending": requests.alive}),
        );
    }

    /// Reinstates persisted tasks behind a single route-less promise, so
    /// sealing it replies to nobody.
    pub fn recover(&mut self) {
        let records = match self.storage.all() {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to load the task store");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        tracing::info!("loaded {} task(s)", records.len());

        let mut promise = Promise::new(Vec::new());
        promise.await_parts(records.len());
        let id = promise.id().to_string();
        self.promises.insert(promise);

        for (task, record) in records {
            tracing::debug!(task = %task, target = %record.url, "recovering task");
            self.promises.set_meta(&id, "token", &record.token);
            self.push(&id, &record.url, &record.args);
        }
    }
}

/// Client-facing message for a request that failed to parse.
fn client_message(e: KilnError) -> String {
    match e {
        KilnError::InvalidRequest(message) => message,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Collaborators, CoreIo};
    use crate::storage::{MemoryStore, NullStore, TaskStore};
    use kiln_common::auth::{NoVerifier, StaticKeyVerifier, Verifier};
    use kiln_common::config::Config;
    use kiln_common::error::Result;
    use kiln_common::protocol::TaskRecord;
    use kiln_common::transport::publisher::Publication;
    use kiln_engine::{
        Isolate, ProcessHandle, SlaveEvent, SlaveMessage, TelemetryEvent,
    };
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct MockHandle;

    impl ProcessHandle for MockHandle {
        fn terminate(&mut self) {}
    }

    /// Records every spawned slave's application and uuid so tests can
    /// address slave events.
    struct MockIsolate {
        spawned: Mutex<Vec<(String, Uuid)>>,
    }

    impl MockIsolate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                spawned: Mutex::new(Vec::new()),
            })
        }

        fn last_slave(&self) -> (String, Uuid) {
            self.spawned.lock().unwrap().last().cloned().unwrap()
        }

        fn spawn_count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }
    }

    impl Isolate for MockIsolate {
        fn spawn(
            &self,
            _image: &str,
            args: &HashMap<String, String>,
        ) -> Result<Box<dyn ProcessHandle>> {
            let app = args["--app"].clone();
            let uuid = args["--uuid"].parse().unwrap();
            self.spawned.lock().unwrap().push((app, uuid));
            Ok(Box::new(MockHandle))
        }
    }

    struct Harness {
        core: Core,
        replies_rx: mpsc::UnboundedReceiver<Multipart>,
        publish_rx: mpsc::UnboundedReceiver<Publication>,
        isolate: Arc<MockIsolate>,
    }

    impl Harness {
        fn with(
            config: Config,
            storage: Arc<dyn TaskStore>,
            verifier: Arc<dyn Verifier>,
        ) -> Self {
            let (_requests_tx, requests_rx) = mpsc::unbounded_channel();
            let (replies_tx, replies_rx) = mpsc::unbounded_channel();
            let (publish_tx, publish_rx) = mpsc::unbounded_channel();
            let (_slaves_tx, slaves_rx) = mpsc::unbounded_channel();
            let (_events_tx, events_rx) = mpsc::unbounded_channel();
            let isolate = MockIsolate::new();

            let core = Core::new(
                config,
                CoreIo {
                    requests: requests_rx,
                    replies: replies_tx,
                    publish: publish_tx,
                    slaves: slaves_rx,
                    events: events_rx,
                },
                Collaborators {
                    storage,
                    verifier,
                    isolate: isolate.clone(),
                },
                CancellationToken::new(),
            );

            Self {
                core,
                replies_rx,
                publish_rx,
                isolate,
            }
        }

        fn new() -> Self {
            Self::with(
                Config::default(),
                Arc::new(NullStore),
                Arc::new(NoVerifier),
            )
        }

        /// Injects a request as it would arrive from the router.
        fn request(&mut self, payload: &Value) {
            self.request_signed(payload, None);
        }

        fn request_signed(&mut self, payload: &Value, signature: Option<&[u8]>) {
            let mut body = vec![payload.to_string().into_bytes()];
            if let Some(signature) = signature {
                body.push(signature.to_vec());
            }
            let message = Multipart::addressed(&[b"client".to_vec()], body);
            self.core.handle_request(message);
        }

        /// The body of the next sealed reply.
        fn reply(&mut self) -> Value {
            let message = self.replies_rx.try_recv().expect("expected a reply");
            let (route, body) = message.split_route().unwrap();
            assert_eq!(route, &[b"client".to_vec()]);
            serde_json::from_slice(&body[0]).unwrap()
        }

        fn drain_futures(&mut self) {
            while let Ok(fulfillment) = self.core.futures_rx.try_recv() {
                self.core.handle_fulfillment(fulfillment);
            }
        }

        fn drain_reaper(&mut self) {
            while let Ok(reap) = self.core.reaper_rx.try_recv() {
                self.core.handle_reap(reap);
            }
        }

        fn slave_event(&mut self, engine: &str, slave: Uuid, event: SlaveEvent) {
            self.core.handle_slave_message(SlaveMessage {
                engine: engine.to_string(),
                slave,
                event,
            });
        }
    }

    #[test]
    fn test_outdated_protocol_version() {
        let mut config = Config::default();
        config.core.protocol = 2;
        let mut h = Harness::with(config, Arc::new(NullStore), Arc::new(NoVerifier));

        h.request(&json!({"version": 0, "token": "T"}));
        assert_eq!(h.reply(), json!({"error": "outdated protocol version"}));
    }

    #[test]
    fn test_missing_token() {
        let mut h = Harness::new();
        h.request(&json!({"version": 3, "token": ""}));
        assert_eq!(h.reply(), json!({"error": "security token expected"}));
    }

    #[test]
    fn test_invalid_json() {
        let mut h = Harness::new();
        let message =
            Multipart::addressed(&[b"client".to_vec()], vec![b"{broken".to_vec()]);
        h.core.handle_request(message);

        let reply = h.reply();
        assert!(reply["error"].is_string());
    }

    #[test]
    fn test_non_object_payload() {
        let mut h = Harness::new();
        let message =
            Multipart::addressed(&[b"client".to_vec()], vec![b"[1,2,3]".to_vec()]);
        h.core.handle_request(message);

        assert_eq!(h.reply(), json!({"error": "object expected"}));
    }

    #[test]
    fn test_unsupported_action() {
        let mut h = Harness::new();
        h.request(&json!({"token": "T", "action": "launch"}));
        assert_eq!(h.reply(), json!({"error": "unsupported action"}));
    }

    #[test]
    fn test_history_disabled_is_unsupported() {
        let mut h = Harness::new();
        h.request(&json!({"token": "T", "action": "history", "targets": {"d": {}}}));
        assert_eq!(h.reply(), json!({"error": "unsupported action"}));
    }

    #[test]
    fn test_push_without_targets() {
        let mut h = Harness::new();
        h.request(&json!({"token": "T", "action": "push"}));
        assert_eq!(h.reply(), json!({"error": "no targets specified"}));

        h.request(&json!({"token": "T", "action": "push", "targets": {}}));
        assert_eq!(h.reply(), json!({"error": "no targets specified"}));
    }

    #[test]
    fn test_signature_verification_failure() {
        let verifier = StaticKeyVerifier::new().with_key("T", b"secret".to_vec());
        let mut h = Harness::with(Config::default(), Arc::new(NullStore), Arc::new(verifier));

        h.request_signed(
            &json!({"version": 3, "token": "T", "action": "stats"}),
            Some(b"wrong!"),
        );

        let reply = h.reply();
        let error = reply["error"].as_str().unwrap();
        assert!(error.contains("Signature rejected"), "got: {error}");
    }

    #[test]
    fn test_signature_verification_success() {
        let verifier = StaticKeyVerifier::new().with_key("T", b"secret".to_vec());
        let mut h = Harness::with(Config::default(), Arc::new(NullStore), Arc::new(verifier));

        h.request_signed(
            &json!({"version": 3, "token": "T", "action": "stats"}),
            Some(b"secret"),
        );

        let reply = h.reply();
        assert!(reply.get("engines").is_some());
    }

    #[test]
    fn test_version_two_skips_verification() {
        // A verifier with no keys rejects everything it is asked about;
        // version 2 must never ask
        let verifier = StaticKeyVerifier::new();
        let mut h = Harness::with(Config::default(), Arc::new(NullStore), Arc::new(verifier));

        h.request(&json!({"version": 2, "token": "T", "action": "stats"}));
        let reply = h.reply();
        assert!(reply.get("engines").is_some());
    }

    #[test]
    fn test_stats_shape() {
        let mut h = Harness::new();
        h.request(&json!({"version": 1, "token": "T", "action": "stats"}));

        let reply = h.reply();
        let object = reply.as_object().unwrap();
        assert_eq!(object.len(), 3);

        assert!(reply["engines"]["total"].is_u64());
        assert!(reply["engines"]["alive"].is_u64());
        assert!(reply["engines"]["list"].is_array());
        assert!(reply["threads"]["total"].is_u64());
        assert!(reply["threads"]["alive"].is_u64());
        assert!(reply["requests"]["total"].is_u64());
        assert!(reply["requests"]["pending"].is_u64());
    }

    #[test]
    fn test_drop_of_unknown_engine() {
        let mut h = Harness::new();
        h.request(&json!({"token": "T", "action": "drop", "targets": {"nope": {}}}));
        assert_eq!(h.reply(), json!({"nope": {"error": "engine not found"}}));
    }

    #[test]
    fn test_bad_target_args_fail_alone() {
        let mut h = Harness::new();
        h.request(&json!({
            "token": "T",
            "action": "push",
            "targets": {"bad": 42, "good": {"event": "emit"}}
        }));

        // The bad target's part is in; the good one is still running, so
        // no seal yet
        assert!(h.replies_rx.try_recv().is_err());
        assert_eq!(h.core.promises.len(), 1);
        assert_eq!(h.isolate.spawn_count(), 1);
    }

    #[test]
    fn test_push_round_trip_preserves_target_names() {
        let mut h = Harness::new();
        h.request(&json!({
            "token": "T",
            "action": "push",
            "targets": {"app": {"event": "emit"}}
        }));

        // Bring the spawned slave alive and complete the job
        let (engine, slave) = h.isolate.last_slave();
        assert_eq!(engine, "app");
        h.slave_event("app", slave, SlaveEvent::Heartbeat);
        h.slave_event("app", slave, SlaveEvent::Chunk(json!({"out": 1})));
        h.slave_event("app", slave, SlaveEvent::Choke);
        h.drain_futures();

        assert_eq!(h.reply(), json!({"app": {"out": 1}}));
        assert!(h.core.promises.is_empty());
    }

    #[test]
    fn test_push_fan_out_gathers_all_parts() {
        let mut h = Harness::new();
        h.request(&json!({
            "token": "T",
            "action": "push",
            "targets": {"a": {"event": "x"}, "b": {"event": "y"}}
        }));

        let spawned = h.isolate.spawned.lock().unwrap().clone();
        assert_eq!(spawned.len(), 2);

        for (engine, slave) in spawned {
            h.slave_event(&engine, slave, SlaveEvent::Heartbeat);
            h.slave_event(&engine, slave, SlaveEvent::Chunk(json!("done")));
            h.slave_event(&engine, slave, SlaveEvent::Choke);
        }
        h.drain_futures();

        assert_eq!(h.reply(), json!({"a": "done", "b": "done"}));
    }

    #[test]
    fn test_engine_reuse_across_requests() {
        let mut h = Harness::new();
        for _ in 0..2 {
            h.request(&json!({
                "token": "T",
                "action": "push",
                "targets": {"app": {"event": "emit"}}
            }));
        }
        assert_eq!(h.core.engines.len(), 1);
    }

    #[test]
    fn test_slave_timeout_reaches_the_client() {
        let mut h = Harness::new();
        h.request(&json!({
            "token": "T",
            "action": "push",
            "targets": {"app": {"event": "emit"}}
        }));

        let (_, slave) = h.isolate.last_slave();
        h.slave_event("app", slave, SlaveEvent::Heartbeat);
        // The watchdog fires while the slave is busy
        h.slave_event("app", slave, SlaveEvent::Timeout);
        h.drain_futures();
        h.drain_reaper();

        let reply = h.reply();
        assert_eq!(reply["app"]["code"], "timeout_error");
        assert_eq!(reply["app"]["error"], "the job has timed out");

        // The dead slave was reaped through the reaper pipe
        assert_eq!(h.core.engines["app"].slave_count(), 0);
    }

    #[test]
    fn test_orphan_fulfillment_is_dropped() {
        let mut h = Harness::new();
        h.core.handle_fulfillment(kiln_engine::Fulfillment {
            future: "no-such-future".to_string(),
            engine: "app".to_string(),
            result: json!(1),
        });
        assert!(h.replies_rx.try_recv().is_err());
    }

    #[test]
    fn test_orphan_slave_message() {
        let mut h = Harness::new();
        // Must be logged and dropped, not panic
        h.slave_event("ghost", Uuid::new_v4(), SlaveEvent::Heartbeat);
    }

    #[test]
    fn test_event_publication_envelope() {
        let mut h = Harness::new();

        let mut fields = BTreeMap::new();
        fields.insert("temp".to_string(), b"21".to_vec());
        fields.insert("load".to_string(), b"0.5".to_vec());
        h.core.handle_event(TelemetryEvent {
            driver: "sensor-1".to_string(),
            fields,
        });

        // One two-frame publication per field, envelope timestamp with
        // three decimal places
        for expected_field in ["load", "temp"] {
            let (envelope, _blob) = h.publish_rx.try_recv().unwrap();
            let parts: Vec<&str> = envelope.split(' ').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], "sensor-1");
            assert_eq!(parts[1], expected_field);
            let (_, decimals) = parts[2].split_once('.').unwrap();
            assert_eq!(decimals.len(), 3);
        }
    }

    #[test]
    fn test_history_round_trip() {
        let mut config = Config::default();
        config.core.history_depth = 4;
        let mut h = Harness::with(config, Arc::new(NullStore), Arc::new(NoVerifier));

        for i in 0..6 {
            let mut fields = BTreeMap::new();
            fields.insert("n".to_string(), i.to_string().into_bytes());
            h.core.handle_event(TelemetryEvent {
                driver: "sensor-1".to_string(),
                fields,
            });
        }

        h.request(&json!({
            "token": "T",
            "action": "history",
            "targets": {"sensor-1": {}}
        }));

        let reply = h.reply();
        let entries = reply["sensor-1"].as_array().unwrap();
        // Bounded by the configured depth, newest first
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["event"]["n"], "5");
        assert_eq!(entries[3]["event"]["n"], "2");
    }

    #[test]
    fn test_history_depth_override_and_empty() {
        let mut config = Config::default();
        config.core.history_depth = 4;
        let mut h = Harness::with(config, Arc::new(NullStore), Arc::new(NoVerifier));

        h.request(&json!({
            "token": "T",
            "action": "history",
            "targets": {"ghost": {}}
        }));
        assert_eq!(h.reply(), json!({"ghost": {"error": "history is empty"}}));
    }

    #[test]
    fn test_recovery_pushes_without_replying() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "task-1",
            TaskRecord {
                token: "T".to_string(),
                url: "app".to_string(),
                args: json!({"event": "emit"}),
            },
        );

        let mut h = Harness::with(Config::default(), store, Arc::new(NoVerifier));
        h.core.recover();

        assert_eq!(h.core.engines.len(), 1);
        assert_eq!(h.core.promises.len(), 1);

        // Complete the recovered job: the promise seals silently
        let (engine, slave) = h.isolate.last_slave();
        h.slave_event(&engine, slave, SlaveEvent::Heartbeat);
        h.slave_event(&engine, slave, SlaveEvent::Choke);
        h.drain_futures();

        assert!(h.core.promises.is_empty());
        assert!(h.replies_rx.try_recv().is_err());
    }

    #[test]
    fn test_reload_clears_and_recovers() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "task-1",
            TaskRecord {
                token: "T".to_string(),
                url: "app".to_string(),
                args: json!({"event": "emit"}),
            },
        );

        let mut h = Harness::with(Config::default(), store.clone(), Arc::new(NoVerifier));

        // An in-flight client request that reload will orphan
        h.request(&json!({
            "token": "T",
            "action": "push",
            "targets": {"other": {"event": "emit"}}
        }));
        assert_eq!(h.core.engines.len(), 1);

        h.core.reload();

        // Only the recovery promise and its engine remain
        assert_eq!(h.core.promises.len(), 1);
        assert_eq!(h.core.engines.len(), 1);
        assert!(h.core.engines.contains_key("app"));

        // A late fulfillment for the orphaned request is dropped
        h.drain_futures();
        assert!(h.replies_rx.try_recv().is_err());
    }

    #[test]
    fn test_purge_erases_the_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "task-1",
            TaskRecord {
                token: "T".to_string(),
                url: "app".to_string(),
                args: json!({"event": "emit"}),
            },
        );

        let mut h = Harness::with(Config::default(), store.clone(), Arc::new(NoVerifier));
        h.core.recover();
        assert_eq!(h.core.engines.len(), 1);

        h.core.purge();

        assert!(h.core.engines.is_empty());
        assert!(h.core.promises.is_empty());
        assert!(store.all().unwrap().is_empty());
    }
}
