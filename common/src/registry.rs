// Job function registry
//
// A process-wide map from job function name to callable, built once at
// startup and shared read-only. The scheduler resolves `func_name` against it
// at dispatch time.

use crate::scheduler::SchedulerView;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Invocation context handed to a job function
#[derive(Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    pub func_name: String,
    /// Fire time this invocation stands for (the coalesced one for catch-up runs)
    pub scheduled_at: DateTime<Utc>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub scheduler: SchedulerView,
}

impl JobContext {
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn kwarg_str(&self, key: &str) -> Option<&str> {
        self.kwargs.get(key).and_then(Value::as_str)
    }
}

/// A schedulable unit of work
#[async_trait]
pub trait JobFunction: Send + Sync {
    async fn call(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a `JobFunction`
struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> JobFunction for FnJob<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: JobContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Immutable name → callable map
#[derive(Default, Clone)]
pub struct JobRegistry {
    functions: HashMap<String, Arc<dyn JobFunction>>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, func_name: &str) -> Option<Arc<dyn JobFunction>> {
        self.functions.get(func_name).cloned()
    }

    pub fn contains(&self, func_name: &str) -> bool {
        self.functions.contains_key(func_name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Default)]
pub struct JobRegistryBuilder {
    functions: HashMap<String, Arc<dyn JobFunction>>,
}

impl JobRegistryBuilder {
    /// Register a callable; a duplicate name replaces the earlier entry
    pub fn register(mut self, name: impl Into<String>, function: Arc<dyn JobFunction>) -> Self {
        let name = name.into();
        if self.functions.insert(name.clone(), function).is_some() {
            warn!(func_name = %name, "Job function registered twice, keeping the latest");
        }
        self
    }

    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(FnJob(f)))
    }

    pub fn build(self) -> JobRegistry {
        info!(count = self.functions.len(), "Job registry built");
        JobRegistry {
            functions: self.functions,
        }
    }
}
