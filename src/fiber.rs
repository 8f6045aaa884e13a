//! Cooperative scheduler for plan-level concurrency
//!
//! Plan futures are `!Send` bodies multiplexed onto the task that drives the
//! [`FiberExecutor`]. Exactly one body runs at a time; bodies give control back
//! whenever they await something that is not ready, e.g. an Executor dispatch
//! or a [`FiberContext::wait`].

use crate::error::{ErrorInfo, FanoutError, FanoutResult, FutureOutcome, EXCEPTION_ERROR};
use crate::plan_future::{PlanFuture, Resumed, MAIN_PLAN_ID};
use futures::FutureExt;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace, warn};

/// Plan id used for futures spawned by `parallelize`
pub const PARALLEL_PLAN: &str = "parallel";

/// Default pause when a pass makes no progress
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// Options for joining futures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOptions {
    /// Give up on futures still running after this long
    pub timeout: Option<Duration>,
    /// Return failed outcomes instead of raising a `ParallelFailure`
    pub catch_errors: bool,
}

impl WaitOptions {
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            catch_errors: false,
        }
    }

    #[must_use]
    pub fn catch_errors(mut self) -> Self {
        self.catch_errors = true;
        self
    }
}

/// How a waiter hands control back while futures are running
#[derive(Debug, Clone, Copy)]
enum Driver {
    /// Called from outside any future: run scheduler passes
    Scheduler,
    /// Called from inside a future: suspend it
    Suspend,
}

struct State {
    active: RefCell<Vec<PlanFuture>>,
    finished: RefCell<Vec<PlanFuture>>,
    next_id: Cell<usize>,
    signal: Arc<Notify>,
    idle_interval: Duration,
}

/// Single-threaded scheduler for plan futures
///
/// Cloning gives another handle to the same scheduler.
#[derive(Clone)]
pub struct FiberExecutor {
    state: Rc<State>,
}

impl Default for FiberExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_idle_interval(DEFAULT_IDLE_INTERVAL)
    }

    /// Scheduler that pauses for at most `idle_interval` when nothing is runnable
    #[must_use]
    pub fn with_idle_interval(idle_interval: Duration) -> Self {
        Self {
            state: Rc::new(State {
                active: RefCell::new(Vec::new()),
                finished: RefCell::new(Vec::new()),
                next_id: Cell::new(MAIN_PLAN_ID + 1),
                signal: Arc::new(Notify::new()),
                idle_interval,
            }),
        }
    }

    /// Register a future running `body` on behalf of `plan_id`
    ///
    /// Returns immediately; the body first runs on the next scheduler pass.
    pub fn create_future<F, Fut>(&self, plan_id: &str, name: Option<&str>, body: F) -> PlanFuture
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: Future<Output = FanoutResult<Value>> + 'static,
    {
        let id = self.state.next_id.get();
        self.state.next_id.set(id + 1);
        self.register(id, name, Some(plan_id), plan_id, body)
    }

    /// Register the main plan future (id 0)
    pub fn run_plan<F, Fut>(&self, plan_id: &str, body: F) -> PlanFuture
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: Future<Output = FanoutResult<Value>> + 'static,
    {
        self.register(MAIN_PLAN_ID, Some(plan_id), None, plan_id, body)
    }

    fn register<F, Fut>(
        &self,
        id: usize,
        name: Option<&str>,
        original_plan: Option<&str>,
        plan_id: &str,
        body: F,
    ) -> PlanFuture
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: Future<Output = FanoutResult<Value>> + 'static,
    {
        let context = FiberContext {
            executor: self.clone(),
            plan_id: plan_id.to_string(),
            future_id: id,
        };
        let future = PlanFuture::new(
            id,
            name,
            original_plan,
            plan_id,
            body(context).boxed_local(),
            Arc::clone(&self.state.signal),
        );
        debug!("Created future '{}' ({}) for plan {}", future.name(), id, plan_id);
        self.state.active.borrow_mut().push(future.clone());
        self.state.signal.notify_one();
        future
    }

    /// True once every future has finished
    #[must_use]
    pub fn plan_complete(&self) -> bool {
        self.state.active.borrow().is_empty()
    }

    /// True while more than one future is running
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.state.active.borrow().len() > 1
    }

    #[must_use]
    pub fn active_futures(&self) -> Vec<PlanFuture> {
        self.state.active.borrow().clone()
    }

    #[must_use]
    pub fn finished_futures(&self) -> Vec<PlanFuture> {
        self.state.finished.borrow().clone()
    }

    /// Every future, running or finished, in creation order
    #[must_use]
    pub fn all_futures(&self) -> Vec<PlanFuture> {
        let mut all = self.active_futures();
        all.extend(self.finished_futures());
        all.sort_by_key(PlanFuture::id);
        all
    }

    /// Futures spawned by a plan invocation
    #[must_use]
    pub fn futures_for_plan(&self, plan_id: &str) -> Vec<PlanFuture> {
        self.all_futures()
            .into_iter()
            .filter(|f| f.original_plan() == Some(plan_id))
            .collect()
    }

    /// Look a future up by id
    #[must_use]
    pub fn future(&self, id: usize) -> Option<PlanFuture> {
        self.all_futures().into_iter().find(|f| f.id() == id)
    }

    /// Resume every active future once, in registration order
    ///
    /// Finished futures are moved out of the active set. When no future could
    /// make progress the pass ends with a short pause, cut short by any waker.
    pub async fn round_robin(&self) {
        let active = self.active_futures();
        let mut progressed = false;
        let mut finished_any = false;

        for future in &active {
            trace!("Checking future '{}'", future.name());
            match future.resume() {
                Resumed::Progressed => progressed = true,
                Resumed::Idle => {}
                Resumed::Finished => finished_any = true,
            }
        }

        if finished_any {
            progressed = true;
            self.collect_finished();
        }

        if progressed {
            tokio::task::yield_now().await;
        } else {
            trace!("Nothing can be resumed, pausing");
            let _ = tokio::time::timeout(self.state.idle_interval, self.state.signal.notified())
                .await;
        }
    }

    /// Move finished futures out of the active set and wake the rest
    fn collect_finished(&self) {
        let done: Vec<PlanFuture> = {
            let mut active = self.state.active.borrow_mut();
            let (done, running): (Vec<_>, Vec<_>) = active.drain(..).partition(|f| !f.alive());
            *active = running;
            done
        };

        let main_running = self
            .state
            .active
            .borrow()
            .iter()
            .any(|f| f.id() == MAIN_PLAN_ID);

        for future in &done {
            // Drops the body
            future.resume();
            trace!("Cleaning up future '{}'", future.name());
            if !main_running && future.id() != MAIN_PLAN_ID {
                if let Some(Err(error)) = future.outcome() {
                    warn!("Error in future '{}': {}", future.name(), error.msg);
                }
            }
        }

        // Waiters are suspended until something they wait on finishes
        for future in self.state.active.borrow().iter() {
            future.wake();
        }
        self.state.finished.borrow_mut().extend(done);
    }

    /// Run passes until every future has finished
    pub async fn run_until_complete(&self) {
        while !self.plan_complete() {
            self.round_robin().await;
        }
    }

    /// Join futures from outside any future, driving the scheduler meanwhile
    ///
    /// # Errors
    ///
    /// Returns `ParallelFailure` if any future failed or timed out and
    /// `catch_errors` is not set
    pub async fn wait(
        &self,
        futures: Vec<PlanFuture>,
        options: WaitOptions,
    ) -> FanoutResult<Vec<FutureOutcome>> {
        self.wait_until_done(|| futures.clone(), options, Driver::Scheduler)
            .await
    }

    async fn wait_until_done<C>(
        &self,
        collect: C,
        options: WaitOptions,
        driver: Driver,
    ) -> FanoutResult<Vec<FutureOutcome>>
    where
        C: Fn() -> Vec<PlanFuture>,
    {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let mut timer = deadline.map(|deadline| Box::pin(tokio::time::sleep_until(deadline)));

        let futures = loop {
            let futures = collect();
            if futures.iter().all(|f| !f.alive()) {
                break futures;
            }

            if let (Some(deadline), Some(timeout)) = (deadline, options.timeout) {
                if Instant::now() >= deadline {
                    for future in futures.iter().filter(|f| f.alive()) {
                        debug!("Future '{}' timed out after {:?}", future.name(), timeout);
                        future.raise(
                            FanoutError::FutureTimeout {
                                name: future.name().to_string(),
                                timeout,
                            }
                            .to_error_info(),
                        );
                    }
                    break futures;
                }
            }

            match driver {
                Driver::Scheduler => self.round_robin().await,
                Driver::Suspend => suspend(&mut timer).await,
            }
        };

        let outcomes: Vec<FutureOutcome> = futures
            .iter()
            .map(|f| {
                f.outcome().unwrap_or_else(|| {
                    Err(ErrorInfo::new(
                        EXCEPTION_ERROR,
                        format!("Future '{}' has no outcome", f.name()),
                    ))
                })
            })
            .collect();

        let failed_indices: Vec<usize> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(i, _)| i)
            .collect();

        if !failed_indices.is_empty() && !options.catch_errors {
            return Err(FanoutError::ParallelFailure {
                results: outcomes,
                failed_indices,
            });
        }
        Ok(outcomes)
    }
}

/// Give control back to the scheduler once
///
/// The caller is resumed when the timer fires or when the scheduler wakes it
/// after some future finishes.
async fn suspend(timer: &mut Option<Pin<Box<Sleep>>>) {
    let mut yielded = false;
    poll_fn(|cx| {
        if yielded {
            return Poll::Ready(());
        }
        yielded = true;
        if let Some(timer) = timer.as_mut() {
            if timer.as_mut().poll(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    })
    .await;
}

/// Handle given to a future's body
///
/// Carries the scheduler, the plan invocation the body is executing and the
/// id of the future the body runs in.
#[derive(Clone)]
pub struct FiberContext {
    executor: FiberExecutor,
    plan_id: String,
    future_id: usize,
}

impl FiberContext {
    #[must_use]
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    #[must_use]
    pub fn future_id(&self) -> usize {
        self.future_id
    }

    #[must_use]
    pub fn executor(&self) -> &FiberExecutor {
        &self.executor
    }

    /// The future this body runs in
    #[must_use]
    pub fn current_future(&self) -> Option<PlanFuture> {
        self.executor.future(self.future_id)
    }

    /// Start a body in the background on behalf of the current plan
    pub fn background<F, Fut>(&self, name: Option<&str>, body: F) -> PlanFuture
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: Future<Output = FanoutResult<Value>> + 'static,
    {
        self.executor.create_future(&self.plan_id, name, body)
    }

    /// Run `body` once per item concurrently and wait for all of them
    ///
    /// # Errors
    ///
    /// Returns `ParallelFailure` if any item's body failed
    pub async fn parallelize<T, F, Fut>(&self, items: Vec<T>, body: F) -> FanoutResult<Vec<Value>>
    where
        T: 'static,
        F: Fn(FiberContext, T) -> Fut + 'static,
        Fut: Future<Output = FanoutResult<Value>> + 'static,
    {
        let body = Rc::new(body);
        let futures: Vec<PlanFuture> = items
            .into_iter()
            .map(|item| {
                let body = Rc::clone(&body);
                self.executor
                    .create_future(PARALLEL_PLAN, None, move |context| body(context, item))
            })
            .collect();

        let outcomes = self
            .executor
            .wait_until_done(|| futures.clone(), WaitOptions::default(), Driver::Suspend)
            .await?;
        outcomes
            .into_iter()
            .map(|outcome| outcome.map_err(FanoutError::from))
            .collect()
    }

    /// Wait for futures, suspending this body meanwhile
    ///
    /// With `None`, waits for every future spawned by the current plan,
    /// including ones spawned while waiting, and returns all their outcomes.
    ///
    /// # Errors
    ///
    /// Returns `InfiniteWait` if `None` would include this very future, and
    /// `ParallelFailure` if any future failed or timed out and `catch_errors`
    /// is not set
    pub async fn wait(
        &self,
        futures: Option<Vec<PlanFuture>>,
        options: WaitOptions,
    ) -> FanoutResult<Vec<FutureOutcome>> {
        match futures {
            Some(futures) => {
                self.executor
                    .wait_until_done(|| futures.clone(), options, Driver::Suspend)
                    .await
            }
            None => {
                let own = self.executor.futures_for_plan(&self.plan_id);
                if own.iter().any(|f| f.id() == self.future_id) {
                    return Err(FanoutError::InfiniteWait);
                }
                self.executor
                    .wait_until_done(
                        || self.executor.futures_for_plan(&self.plan_id),
                        options,
                        Driver::Suspend,
                    )
                    .await
            }
        }
    }

    /// Run `body` as a nested plan invocation inside the current future
    ///
    /// Futures the body spawns belong to `plan_id`, so a bare `wait` inside it
    /// only joins those.
    pub async fn run_subplan<F, Fut, T>(&self, plan_id: &str, body: F) -> T
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let future = self.current_future();
        if let Some(future) = &future {
            future.set_current_plan(plan_id);
        }

        let context = FiberContext {
            executor: self.executor.clone(),
            plan_id: plan_id.to_string(),
            future_id: self.future_id,
        };
        let result = body(context).await;

        if let Some(future) = &future {
            future.set_current_plan(&self.plan_id);
        }
        result
    }
}
