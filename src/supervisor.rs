//! Supervisor (§4.7): tracks background tasks by name and restarts any
//! that finished unexpectedly; coordinates graceful shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskFactory = Box<dyn Fn() -> TaskFuture + Send + Sync>;

struct Supervised {
    handle: JoinHandle<()>,
    factory: TaskFactory,
}

pub struct Supervisor {
    tasks: Mutex<HashMap<&'static str, Supervised>>,
    shutdown_tx: watch::Sender<bool>,
    cancellation: CancellationToken,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Mutex::new(HashMap::new()),
            shutdown_tx,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Spawns `factory()` now and registers it under `name` so it can be
    /// restarted later if it exits before shutdown.
    pub async fn spawn<F>(&self, name: &'static str, factory: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let handle = tokio::spawn(factory());
        let supervised = Supervised {
            handle,
            factory: Box::new(factory),
        };
        self.tasks.lock().await.insert(name, supervised);
    }

    /// Called on the dispatch path (§4.4 step 2): restarts any registered
    /// task whose handle has already finished. Cheap when nothing has
    /// crashed — a single `is_finished()` check per task.
    pub async fn check_and_restart(&self) {
        let mut tasks = self.tasks.lock().await;
        for (name, supervised) in tasks.iter_mut() {
            if supervised.handle.is_finished() {
                warn!("supervised task '{name}' exited, restarting");
                supervised.handle = tokio::spawn((supervised.factory)());
            }
        }
    }

    /// Signals shutdown to every supervised task and waits for them to
    /// finish. Broker and persistence loops observe either the shutdown
    /// watch or the cancellation token and exit promptly.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.cancellation.cancel();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().map(|(_, s)| s.handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSupervisor = Arc<Supervisor>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn restarts_a_task_that_exits_early() {
        let supervisor = Supervisor::new();
        let runs = Arc::new(AtomicU32::new(0));
        let runs_for_factory = runs.clone();
        supervisor
            .spawn("flaky", move || {
                let runs = runs_for_factory.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        supervisor.check_and_restart().await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }
}
