//! Concurrent supervision of strategy instances.
//!
//! Every instance runs on its own task with its own stop channel. A fatal
//! error or a panic ends only that task; siblings keep ticking.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
    time::{timeout_at, Instant},
};
use tracing::{error, info, warn, Instrument};

use crate::{
    client::TradingApi,
    engine::StrategyInstance,
    errors::{Error, Result},
};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How an instance's task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceExit {
    Clean,
    Failed(String),
    Panicked(String),
    /// Did not finish within the grace period and was aborted.
    Aborted,
}

impl InstanceExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    fn from_join(joined: std::result::Result<Result<()>, JoinError>) -> Self {
        match joined {
            Ok(Ok(())) => Self::Clean,
            Ok(Err(err)) => Self::Failed(err.to_string()),
            Err(err) if err.is_panic() => {
                let payload = err.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Self::Panicked(message)
            }
            Err(_) => Self::Aborted,
        }
    }
}

impl fmt::Display for InstanceExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean"),
            Self::Failed(why) => write!(f, "failed: {why}"),
            Self::Panicked(why) => write!(f, "panicked: {why}"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Exit of every instance the runner supervised.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub exits: BTreeMap<String, InstanceExit>,
}

impl RunReport {
    pub fn all_clean(&self) -> bool {
        self.exits.values().all(InstanceExit::is_clean)
    }

    /// 0 when every instance stopped cleanly, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_clean() {
            0
        } else {
            1
        }
    }
}

struct InstanceHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

/// Reports the instance as finished however its task ends, unwinding
/// included.
struct DoneGuard {
    name: String,
    done: mpsc::UnboundedSender<String>,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.done.send(std::mem::take(&mut self.name));
    }
}

pub struct Runner {
    instances: HashMap<String, InstanceHandle>,
    exits: BTreeMap<String, InstanceExit>,
    done_tx: mpsc::UnboundedSender<String>,
    done_rx: mpsc::UnboundedReceiver<String>,
    grace: Duration,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl Runner {
    pub fn new(grace: Duration) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            instances: HashMap::new(),
            exits: BTreeMap::new(),
            done_tx,
            done_rx,
            grace,
        }
    }

    pub fn running(&self) -> usize {
        self.instances.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.instances
            .get(name)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Spawns `instance` on its own task. Names must be unique.
    pub fn start<C>(&mut self, instance: StrategyInstance<C>) -> Result<()>
    where
        C: TradingApi + 'static,
    {
        let name = instance.name().to_string();
        if self.instances.contains_key(&name) || self.exits.contains_key(&name) {
            return Err(Error::config(name, "name", "duplicate strategy name"));
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let span = instance.span();
        let guard = DoneGuard {
            name: name.clone(),
            done: self.done_tx.clone(),
        };
        let task = tokio::spawn(
            async move {
                let _guard = guard;
                instance.run(stop_rx).await
            }
            .instrument(span),
        );
        info!(strategy = %name, "strategy started");
        self.instances.insert(
            name,
            InstanceHandle {
                stop: stop_tx,
                task,
            },
        );
        Ok(())
    }

    /// Signals one instance to stop and waits up to the grace period.
    pub async fn stop(&mut self, name: &str) -> Option<InstanceExit> {
        let handle = self.instances.remove(name)?;
        let deadline = Instant::now() + self.grace;
        let exit = Self::wind_down(name, handle, deadline).await;
        self.exits.insert(name.to_string(), exit.clone());
        Some(exit)
    }

    /// Stops every instance against one shared deadline.
    pub async fn stop_all(&mut self) {
        let deadline = Instant::now() + self.grace;
        for handle in self.instances.values() {
            let _ = handle.stop.send(true);
        }
        let pending: Vec<(String, InstanceHandle)> = self.instances.drain().collect();
        let exits = join_all(pending.into_iter().map(|(name, handle)| async move {
            let exit = Self::wind_down(&name, handle, deadline).await;
            (name, exit)
        }))
        .await;
        self.exits.extend(exits);
    }

    async fn wind_down(name: &str, mut handle: InstanceHandle, deadline: Instant) -> InstanceExit {
        let _ = handle.stop.send(true);
        let exit = match timeout_at(deadline, &mut handle.task).await {
            Ok(joined) => InstanceExit::from_join(joined),
            Err(_) => {
                warn!(strategy = %name, "strategy missed the grace period; aborting");
                handle.task.abort();
                InstanceExit::Aborted
            }
        };
        log_exit(name, &exit);
        exit
    }

    /// Collects an instance whose task already ended on its own.
    async fn reap(&mut self, name: &str) {
        let Some(handle) = self.instances.remove(name) else {
            return;
        };
        let exit = InstanceExit::from_join(handle.task.await);
        log_exit(name, &exit);
        self.exits.insert(name.to_string(), exit);
    }

    /// Supervises until `shutdown` resolves or every instance has ended, then
    /// stops whatever is still running.
    pub async fn run_until<F>(mut self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        while !self.instances.is_empty() {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping all strategies");
                    break;
                }
                Some(name) = self.done_rx.recv() => {
                    self.reap(&name).await;
                }
            }
        }
        self.stop_all().await;
        RunReport { exits: self.exits }
    }
}

fn log_exit(name: &str, exit: &InstanceExit) {
    match exit {
        InstanceExit::Clean => info!(strategy = %name, "strategy exited cleanly"),
        other => error!(strategy = %name, exit = %other, "strategy exited abnormally"),
    }
}
