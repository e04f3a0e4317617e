//! Background task ownership and process shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

struct Supervised {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns a set of named background tasks.
///
/// Each task gets a child of the supervisor's token, so it can be stopped on
/// its own or together with its siblings.
pub struct Supervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, Supervised>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.tasks().keys().cloned().collect();
        names.sort();
        f.debug_struct("Supervisor").field("tasks", &names).finish()
    }
}

impl Supervisor {
    /// Supervisor whose tasks are also cancelled when `parent` is.
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            root: parent.child_token(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Supervised>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `task` under `name`, replacing (and cancelling) any previous
    /// task with that name.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.root.child_token();
        let handle = tokio::spawn(task(cancel.clone()));
        if let Some(previous) = self.tasks().insert(name.clone(), Supervised { cancel, handle }) {
            tracing::debug!(task = %name, "Replacing supervised task");
            previous.cancel.cancel();
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks()
            .get(name)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel one task and wait for it to return.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(task) = self.tasks().remove(name) else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!(task = %name, error = %e, "Supervised task ended abnormally");
        }
        true
    }

    /// Cancel every task and wait for all of them.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let tasks: Vec<(String, Supervised)> = self.tasks().drain().collect();
        for (name, task) in tasks {
            if let Err(e) = task.handle.await {
                tracing::warn!(task = %name, error = %e, "Supervised task ended abnormally");
            }
        }
    }

    /// Abort every task at its next suspension point without letting it
    /// clean up.
    pub fn abort_all(&self) {
        for (_, task) in self.tasks().drain() {
            task.handle.abort();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}
