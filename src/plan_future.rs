use crate::error::{ErrorInfo, FanoutResult, FutureOutcome};
use futures::future::LocalBoxFuture;
use futures::task::{waker, ArcWake};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tracing::trace;

/// Id of the main plan future
pub const MAIN_PLAN_ID: usize = 0;

/// Body of a plan future
pub type PlanBody = LocalBoxFuture<'static, FanoutResult<Value>>;

/// Lifecycle of a plan future
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Running,
    Done,
    Error,
}

impl FutureState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FutureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single resume did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumed {
    /// The body was polled and is still pending
    Progressed,
    /// Nothing has woken the body since its last poll
    Idle,
    /// The future is no longer alive
    Finished,
}

/// Waker target: marks the future runnable and pokes the scheduler
struct WakeFlag {
    woken: AtomicBool,
    signal: Arc<Notify>,
}

impl ArcWake for WakeFlag {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.signal.notify_one();
    }
}

struct Inner {
    id: usize,
    name: String,
    original_plan: Option<String>,
    current_plan: RefCell<String>,
    state: Cell<FutureState>,
    outcome: RefCell<Option<FutureOutcome>>,
    body: RefCell<Option<PlanBody>>,
    wake: Arc<WakeFlag>,
    resumes: Cell<usize>,
}

/// Handle to one cooperatively scheduled unit of plan work
///
/// Handles are cheap to clone and all refer to the same future. The body is
/// owned by the future and dropped as soon as it is no longer alive.
#[derive(Clone)]
pub struct PlanFuture {
    inner: Rc<Inner>,
}

impl PlanFuture {
    pub(crate) fn new(
        id: usize,
        name: Option<&str>,
        original_plan: Option<&str>,
        current_plan: &str,
        body: PlanBody,
        signal: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                id,
                name: name.map_or_else(|| format!("Future {id}"), str::to_string),
                original_plan: original_plan.map(str::to_string),
                current_plan: RefCell::new(current_plan.to_string()),
                state: Cell::new(FutureState::Running),
                outcome: RefCell::new(None),
                body: RefCell::new(Some(body)),
                wake: Arc::new(WakeFlag {
                    woken: AtomicBool::new(true),
                    signal,
                }),
                resumes: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Plan invocation that spawned this future; `None` for the main plan
    #[must_use]
    pub fn original_plan(&self) -> Option<&str> {
        self.inner.original_plan.as_deref()
    }

    /// Plan invocation currently executing inside this future
    #[must_use]
    pub fn current_plan(&self) -> String {
        self.inner.current_plan.borrow().clone()
    }

    pub(crate) fn set_current_plan(&self, plan_id: &str) {
        *self.inner.current_plan.borrow_mut() = plan_id.to_string();
    }

    #[must_use]
    pub fn state(&self) -> FutureState {
        self.inner.state.get()
    }

    #[must_use]
    pub fn alive(&self) -> bool {
        self.state() == FutureState::Running
    }

    /// The cached outcome, once the future has finished
    #[must_use]
    pub fn outcome(&self) -> Option<FutureOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Number of times the body has been polled
    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.inner.resumes.get()
    }

    /// Finish the future with an error
    ///
    /// The body is not polled again; it is dropped on the next resume. Has no
    /// effect on a future that already finished.
    pub fn raise(&self, error: ErrorInfo) {
        if self.alive() {
            trace!("Raising '{}' in future '{}'", error.msg, self.name());
            self.finish(Err(error));
        }
    }

    /// Mark the future runnable
    pub(crate) fn wake(&self) {
        self.inner.wake.woken.store(true, Ordering::SeqCst);
    }

    fn finish(&self, outcome: FutureOutcome) {
        let state = if outcome.is_ok() {
            FutureState::Done
        } else {
            FutureState::Error
        };
        *self.inner.outcome.borrow_mut() = Some(outcome);
        self.inner.state.set(state);
    }

    /// Poll the body once if it has been woken
    pub(crate) fn resume(&self) -> Resumed {
        if !self.alive() {
            self.inner.body.borrow_mut().take();
            return Resumed::Finished;
        }
        if !self.inner.wake.woken.swap(false, Ordering::SeqCst) {
            return Resumed::Idle;
        }

        let taken = self.inner.body.borrow_mut().take();
        let Some(mut body) = taken else {
            // Already being polled further up the stack
            self.wake();
            return Resumed::Idle;
        };

        trace!("Resuming future '{}'", self.name());
        self.inner.resumes.set(self.inner.resumes.get() + 1);
        let waker = waker(Arc::clone(&self.inner.wake));
        let mut cx = Context::from_waker(&waker);

        match body.as_mut().poll(&mut cx) {
            Poll::Ready(result) => {
                if self.alive() {
                    self.finish(result.map_err(|e| e.to_error_info()));
                }
                Resumed::Finished
            }
            Poll::Pending if self.alive() => {
                *self.inner.body.borrow_mut() = Some(body);
                Resumed::Progressed
            }
            Poll::Pending => Resumed::Finished,
        }
    }
}

impl PartialEq for PlanFuture {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for PlanFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanFuture")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("original_plan", &self.original_plan())
            .field("state", &self.state())
            .finish()
    }
}
