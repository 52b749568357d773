//! In-process functions.
//!
//! An `InProcessFunction` entry names a function registered with the agent.
//! The function runs as a tokio task and receives the entry's arguments plus
//! a stop signal that SOFT STOP and FINISH PROCESSING raise.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use camfleet_manifest::ProcessManifestEntry;
use camfleet_proto::ProcessId;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::{Exit, ProcessHandle};
use crate::error::LaunchError;

/// Everything an in-process function gets from its manifest entry.
pub struct FunctionContext {
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
    pub flags: BTreeSet<String>,
    stop: watch::Receiver<bool>,
}

impl FunctionContext {
    /// Returns true once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves when a stop is requested or the handle is gone.
    pub async fn stopped(&mut self) {
        let _ = self.stop.wait_for(|stop| *stop).await;
    }
}

/// A function the agent can run as a managed process.
///
/// Returning at all, `Ok` included, counts as the process exiting.
#[async_trait]
pub trait ProcessFunction: Send + Sync + 'static {
    async fn run(&self, ctx: FunctionContext) -> anyhow::Result<()>;
}

/// Runs until asked to stop.
pub struct IdleFunction;

#[async_trait]
impl ProcessFunction for IdleFunction {
    async fn run(&self, mut ctx: FunctionContext) -> anyhow::Result<()> {
        ctx.stopped().await;
        Ok(())
    }
}

/// Sleeps for `args[0]` (or `kwargs["seconds"]`) seconds, then returns.
/// Stops early when asked.
pub struct SleepFunction;

#[async_trait]
impl ProcessFunction for SleepFunction {
    async fn run(&self, mut ctx: FunctionContext) -> anyhow::Result<()> {
        let raw = ctx
            .args
            .first()
            .or_else(|| ctx.kwargs.get("seconds"))
            .context("sleep needs a duration in seconds")?;
        let secs: f64 = raw
            .parse()
            .with_context(|| format!("invalid sleep duration '{raw}'"))?;
        let duration = Duration::try_from_secs_f64(secs)
            .with_context(|| format!("invalid sleep duration '{raw}'"))?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = ctx.stopped() => {}
        }
        Ok(())
    }
}

/// Functions available to `InProcessFunction` entries, by name.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn ProcessFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `idle` and `sleep`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("idle", IdleFunction);
        registry.register("sleep", SleepFunction);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, function: impl ProcessFunction) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Start the function named by the entry's command.
    pub fn spawn(&self, entry: &ProcessManifestEntry) -> Result<FunctionHandle, LaunchError> {
        let function = self
            .functions
            .get(&entry.command)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownFunction(entry.command.clone()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let ctx = FunctionContext {
            args: entry.args.clone(),
            kwargs: entry.kwargs.clone(),
            flags: entry.flags.clone(),
            stop: stop_rx,
        };

        let id = Uuid::new_v4();
        debug!(task_id = %id, function = %entry.command, "Spawning in-process function");
        let task = tokio::spawn(async move { function.run(ctx).await });

        Ok(FunctionHandle {
            id,
            task,
            stop: stop_tx,
            exit: None,
        })
    }
}

/// A running in-process function.
pub struct FunctionHandle {
    id: Uuid,
    task: JoinHandle<anyhow::Result<()>>,
    stop: watch::Sender<bool>,
    exit: Option<Exit>,
}

impl ProcessHandle for FunctionHandle {
    fn id(&self) -> ProcessId {
        ProcessId::Task(self.id)
    }

    fn poll_exit(&mut self) -> Option<Exit> {
        if self.exit.is_none() && self.task.is_finished() {
            self.exit = (&mut self.task).now_or_never().map(|joined| match joined {
                Ok(Ok(())) => Exit::Returned,
                Ok(Err(e)) => Exit::Failed(format!("{e:#}")),
                Err(e) if e.is_cancelled() => Exit::Failed("task cancelled".to_string()),
                Err(_) => Exit::Failed("task panicked".to_string()),
            });
        }
        self.exit.clone()
    }

    fn request_stop(&mut self) -> anyhow::Result<()> {
        self.stop.send_replace(true);
        Ok(())
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        self.task.abort();
        Ok(())
    }
}
