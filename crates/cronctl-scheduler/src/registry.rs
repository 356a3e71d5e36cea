use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use cronctl_core::Event;
use serde_json::Value;
use tracing::debug;

/// What a handler receives when its event runs.
#[derive(Debug, Clone)]
pub struct EventContext {
    /// The claimed event, as stored.
    pub event: Event,
    /// Epoch seconds at which the run started.
    pub now: i64,
}

impl EventContext {
    pub fn args(&self) -> &[Value] {
        &self.event.args
    }
}

/// Code bound to an action name.
///
/// An `Err` marks the event failed with the error's message; a panic is
/// caught by the runner and treated the same way.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn run(&self, ctx: EventContext) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, ctx: EventContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Action name to handler map, shared by the queue builder and the runner.
///
/// Events whose action has no entry here are never offered to the external
/// runner and are refused if asked to run.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `action` to `handler`, replacing any previous binding.
    pub fn register(&self, action: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let action = action.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        debug!(%action, "handler registered");
        handlers.insert(action, handler);
    }

    /// Remove a binding. Silent no-op if the action is unknown.
    pub fn unregister(&self, action: &str) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.remove(action).is_some() {
            debug!(action, "handler unregistered");
        }
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(action).cloned()
    }

    pub fn contains(&self, action: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut actions: Vec<String> = handlers.keys().cloned().collect();
        actions.sort();
        actions
    }
}
