//! Coordinate the stop of listener processes
//!
//! An embedding process usually runs one or more listener loops next to its own work. When the
//! process is asked to stop, e.g., by `ctrl+c`, each listener must flush its open batch, wait for
//! the batch in flight to be dispatched, and unsubscribe before the process may exit.
//!
//! Components [`register`][ShutdownManager::register] with the [`ShutdownManager`] to obtain a
//! [`ShutdownToken`]. The token is used to
//! [`wait_for_shutdown`][ShutdownToken::wait_for_shutdown], or to derive a
//! [`child_token`][ShutdownToken::child_token] that can also be cancelled locally, and finally to
//! signal [`complete`][ShutdownToken::complete] once the component is drained.
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

/// Wait for a `SIGTERM` or `SIGINT` on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM, stopping listeners"),
        _ = int.recv() => info!("received SIGINT, stopping listeners"),
    }
}

/// Wait for a `ctrl+c` on Windows systems
#[cfg(windows)]
pub async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl+c, stopping listeners");
}

/// Coordinates the ordered stop of registered components
#[derive(Debug)]
pub struct ShutdownManager {
    token: CancellationToken,
    tasks: TaskTracker,
    pending: Arc<Mutex<Vec<&'static str>>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            pending: Default::default(),
        }
    }

    /// Register a component that needs to drain before the process may exit
    ///
    /// The caller must invoke [`complete`][ShutdownToken::complete] on the returned token, or drop
    /// every clone of it, for [`join`][ShutdownManager::join] to return.
    pub fn register(&self, component: &'static str) -> ShutdownToken {
        let (tx, rx) = oneshot::channel::<()>();
        self.pending.lock().push(component);
        let pending = Arc::clone(&self.pending);
        self.tasks.spawn(async move {
            // a dropped sender counts as completion
            let _ = rx.await;
            let mut pending = pending.lock();
            if let Some(pos) = pending.iter().position(|c| *c == component) {
                pending.remove(pos);
            }
            debug!(component, "component completed shutdown");
        });
        ShutdownToken::new(component, self.token.clone(), tx)
    }

    /// Signal every registered component to stop
    pub fn shutdown(&self) {
        info!(pending = ?self.pending(), "shutdown requested");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Names of the components that have not completed yet
    pub fn pending(&self) -> Vec<&'static str> {
        self.pending.lock().clone()
    }

    /// Wait for all registered components to signal completion
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        info!("all components stopped");
    }
}

/// Handed to a component by [`ShutdownManager::register`]
///
/// Clones share the completion signal, so any clone may call
/// [`complete`][ShutdownToken::complete].
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    component: &'static str,
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(component: &'static str, token: CancellationToken, tx: oneshot::Sender<()>) -> Self {
        Self {
            component,
            token,
            complete_tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Stop the whole process because of an unrecoverable state in this component
    pub fn trigger_shutdown(&self) {
        info!(component = self.component, "component triggered shutdown");
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the issuing [`ShutdownManager`] is shut down
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// A token that is cancelled with the process, and that can also be cancelled on its own to
    /// stop only this component
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signal that the component is drained and the process may exit
    pub fn complete(&self) {
        if let Some(tx) = self.complete_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}
