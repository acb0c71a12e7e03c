//! Process isolation collaborator.
//!
//! The engine never forks processes itself; it asks an [`Isolate`] for a
//! handle and only ever calls `terminate()` on it. The default backend
//! shells out through `tokio::process`, other backends (containers,
//! cgroups) plug in behind the same trait.

use std::collections::HashMap;

use kiln_common::error::{KilnError, Result};

/// A running worker process.
pub trait ProcessHandle: Send {
    /// Terminates the process. Idempotent; errors are logged, not returned,
    /// because the supervisor is already on its way to the dead state.
    fn terminate(&mut self);
}

/// Spawns worker processes for slave supervisors.
pub trait Isolate: Send + Sync {
    fn spawn(&self, image: &str, args: &HashMap<String, String>)
        -> Result<Box<dyn ProcessHandle>>;
}

/// Plain subprocess isolation.
pub struct ProcessIsolate;

impl Isolate for ProcessIsolate {
    fn spawn(
        &self,
        image: &str,
        args: &HashMap<String, String>,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut command = tokio::process::Command::new(image);
        for (key, value) in args {
            command.arg(key).arg(value);
        }
        command.kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| KilnError::Spawn(format!("failed to spawn {image}: {e}")))?;

        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: tokio::process::Child,
}

impl ProcessHandle for ChildHandle {
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "failed to kill worker process");
        }
    }
}
