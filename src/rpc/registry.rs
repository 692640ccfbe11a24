//! Task Handler Registry
//!
//! Maps string-based handler names to executable Rust closures, keeping the
//! engine generic over what a "task" actually does. The delivery protocol
//! never inspects payload contents; it only routes them to a handler here.
//!
//! Alongside the execution closure, a handler may register an acknowledgment
//! hook, invoked exactly once when the caller's final confirmation licenses
//! the engine to forget the task.

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for a thread-safe, asynchronous task handler. Takes the request
/// body and resolves to the reply value.
pub type TaskHandlerFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Hook invoked with the task id once a task is fully acknowledged.
pub type AckHookFn = Arc<dyn Fn(u64) + Send + Sync>;

pub struct TaskHandlerRegistry {
    handlers: DashMap<String, TaskHandlerFn>,
    ack_hooks: DashMap<String, AckHookFn>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            ack_hooks: DashMap::new(),
        })
    }

    /// Register the execution closure for a handler name.
    pub fn register<F, Fut>(&self, handler_name: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        // Box::pin type-erases the concrete future so different async
        // functions can live in the same map.
        let handler_fn: TaskHandlerFn = Arc::new(move |body: Value| {
            Box::pin(handler(body)) as Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        });

        self.handlers.insert(handler_name.to_string(), handler_fn);

        tracing::info!("Registered task handler: {}", handler_name);
    }

    /// Register the acknowledgment hook for a handler name.
    pub fn on_acknowledged<F>(&self, handler_name: &str, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.ack_hooks.insert(handler_name.to_string(), Arc::new(hook));
    }

    /// Look up a handler by name and execute it with the request body.
    pub async fn execute(&self, handler_name: &str, body: Value) -> Result<Value> {
        if let Some(handler_fn) = self.handlers.get(handler_name) {
            tracing::debug!("Executing task with handler '{}'", handler_name);
            handler_fn.value()(body).await
        } else {
            let error = format!("Unknown task handler: {}", handler_name);
            tracing::error!("{}", error);
            Err(anyhow::anyhow!(error))
        }
    }

    /// Fire the acknowledgment hook for a fully confirmed task, if one is
    /// registered.
    pub fn acknowledge(&self, handler_name: &str, task_id: u64) {
        if let Some(hook) = self.ack_hooks.get(handler_name) {
            hook.value()(task_id);
        }
    }

    pub fn has_handler(&self, handler_name: &str) -> bool {
        self.handlers.contains_key(handler_name)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
