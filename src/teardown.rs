//! Teardown coordinator
//!
//! Cleanup actions register in the order resources come up and run in LIFO
//! order on every exit path: normal return, workload failure, readiness
//! failure, or a fatal signal. Actions tolerate their target already being
//! gone; failures are logged and never propagated.

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Ordered registry of cleanup actions
#[derive(Default)]
pub struct Teardown {
    actions: Vec<(String, Action)>,
}

impl Teardown {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action. Actions run in reverse registration
    /// order.
    pub fn register<F, Fut>(&mut self, name: &str, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.actions
            .push((name.to_string(), Box::new(move || Box::pin(action()))));
    }

    /// Run all registered actions, newest first. A failing action is
    /// logged and the rest still run.
    pub async fn run(&mut self) {
        while let Some((name, action)) = self.actions.pop() {
            debug!(action = %name, "running teardown action");
            if let Err(e) = action().await {
                warn!(action = %name, error = %e, "teardown action failed");
            }
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM, naming the signal.
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            None
        }
    };
    let term_recv = async move {
        match term.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term_recv => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_actions_run_in_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new();

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            teardown.register(name, move || async move {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }

        teardown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_the_rest() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new();

        {
            let order = Arc::clone(&order);
            teardown.register("survivor", move || async move {
                order.lock().unwrap().push("survivor");
                Ok(())
            });
        }
        teardown.register("doomed", || async {
            anyhow::bail!("target already gone")
        });

        teardown.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["survivor"]);
    }

    #[tokio::test]
    async fn test_run_drains_the_registry() {
        let mut teardown = Teardown::new();
        teardown.register("once", || async { Ok(()) });

        teardown.run().await;
        teardown.run().await; // second run is a no-op
        assert!(teardown.actions.is_empty());
    }
}
