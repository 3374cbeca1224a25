//! Deduplicated background task execution
//!
//! A runner owns one async task factory. However many callers ask for a
//! run, at most one instance of the task executes at a time; concurrent
//! callers await the in-flight run's result. A successful result younger
//! than the configured reuse window is handed out without running the task
//! again. The cached-result window is per runner instance; there is no
//! process-wide state.
//!
//! Caller timeouts are caller-scoped: an abandoned wait never cancels the
//! underlying run, which is bounded only by the runner's own task timeout
//! and by `stop`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunnerConfig;
use crate::error::{CacheError, CacheOpResult};

type TaskFuture<T> = Pin<Box<dyn Future<Output = CacheOpResult<T>> + Send>>;
type TaskFactory<T> = Arc<dyn Fn(CancellationToken) -> TaskFuture<T> + Send + Sync>;

/// Result broadcast to every waiter of one run. Errors cross task
/// boundaries as strings so each waiter gets its own error value.
type SharedResult<T> = Result<T, String>;

struct RunnerState<T> {
    in_flight: Option<watch::Receiver<Option<SharedResult<T>>>>,
    last_success: Option<(Instant, T)>,
    stopped: bool,
}

/// Executes one task at a time, sharing in-flight results between callers
pub struct NonOverlappingRunner<T> {
    name: String,
    config: RunnerConfig,
    factory: TaskFactory<T>,
    state: Arc<Mutex<RunnerState<T>>>,
    cancel: CancellationToken,
}

impl<T> NonOverlappingRunner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Runner over the given task factory. The factory is invoked once per
    /// run with a token that fires on `stop`.
    pub fn new<F, Fut>(name: impl Into<String>, config: RunnerConfig, factory: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CacheOpResult<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            config,
            factory: Arc::new(move |ct| Box::pin(factory(ct))),
            state: Arc::new(Mutex::new(RunnerState {
                in_flight: None,
                last_success: None,
                stopped: false,
            })),
            cancel: CancellationToken::new(),
        }
    }

    fn reuse_window(&self) -> Duration {
        Duration::from_millis(self.config.reuse_result_within_ms)
    }

    /// Run the task, or join the in-flight run, or reuse a fresh result.
    ///
    /// `caller_timeout` bounds only this caller's wait; the underlying run
    /// continues until its own task timeout.
    pub async fn run(&self, caller_timeout: Duration, ct: &CancellationToken) -> CacheOpResult<T> {
        let mut rx = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(CacheError::Stopped);
            }

            let reuse = self.reuse_window();
            if !reuse.is_zero() {
                if let Some((at, value)) = &state.last_success {
                    if at.elapsed() < reuse {
                        return Ok(value.clone());
                    }
                }
            }

            match &state.in_flight {
                Some(rx) => rx.clone(),
                None => self.start_run(&mut state, None),
            }
        };

        let wait = async {
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err("runner task dropped".to_string());
                }
            }
        };

        tokio::select! {
            result = wait => result.map_err(CacheError::FactoryFailed),
            _ = tokio::time::sleep(caller_timeout) => {
                Err(CacheError::CoalescingTimeout(self.name.clone()))
            }
            _ = ct.cancelled() => Err(CacheError::Cancelled),
        }
    }

    /// Start a run without waiting for its result. No-op when a run is
    /// already in flight, a fresh result exists, or the runner is stopped.
    pub fn fire_and_forget(&self, task_timeout: Option<Duration>) {
        let mut state = self.state.lock();
        if state.stopped || state.in_flight.is_some() {
            return;
        }
        let reuse = self.reuse_window();
        if !reuse.is_zero() {
            if let Some((at, _)) = &state.last_success {
                if at.elapsed() < reuse {
                    return;
                }
            }
        }
        self.start_run(&mut state, task_timeout);
    }

    fn start_run(
        &self,
        state: &mut RunnerState<T>,
        task_timeout: Option<Duration>,
    ) -> watch::Receiver<Option<SharedResult<T>>> {
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some(rx.clone());

        let factory = self.factory.clone();
        let task_ct = self.cancel.child_token();
        let timeout =
            task_timeout.unwrap_or_else(|| Duration::from_millis(self.config.task_timeout_ms));
        let name = self.name.clone();
        let shared_state = self.state.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = factory(task_ct.clone()) => {
                    result.map_err(|err| err.to_string())
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!(runner = %name, "task exceeded its timeout");
                    task_ct.cancel();
                    Err(format!("task timed out after {timeout:?}"))
                }
                _ = task_ct.cancelled() => Err("runner stopped".to_string()),
            };

            {
                let mut guard = shared_state.lock();
                guard.in_flight = None;
                if let Ok(value) = &result {
                    guard.last_success = Some((Instant::now(), value.clone()));
                }
            }
            // A closed channel only means every waiter gave up.
            let _ = tx.send(Some(result));
        });

        rx
    }

    /// Cancel any in-flight run and reject future callers.
    pub async fn stop(&self, ct: &CancellationToken) -> CacheOpResult<()> {
        let rx = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.in_flight.clone()
        };
        self.cancel.cancel();

        if let Some(mut rx) = rx {
            let settled = async {
                while rx.borrow_and_update().is_none() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            tokio::select! {
                _ = settled => {}
                _ = ct.cancelled() => return Err(CacheError::Cancelled),
            }
        }
        debug!(runner = %self.name, "runner stopped");
        Ok(())
    }
}
