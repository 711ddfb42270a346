//! Single-threaded suspendable tasks.
//!
//! A [`Fiber`] owns a boxed local future and polls it with a no-op waker: the future only
//! makes progress when someone calls [`Fiber::start`], [`Fiber::resume`] or [`Fiber::throw`].
//! Code running inside the fiber yields with `fiber.suspend(value).await`; the suspension
//! propagates through every `await` between the step and the fiber, so a whole nested
//! sub-pipeline pauses at once.

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use anyhow::anyhow;
use futures_util::{
    FutureExt,
    future::LocalBoxFuture,
    task::noop_waker_ref,
};
use tracing::debug;

use crate::{
    error::{RecipeError, Result},
    workplan::Value,
};

/// Future driven by a fiber.
pub type FiberFuture = LocalBoxFuture<'static, anyhow::Result<()>>;

/// Lifecycle of a fiber as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    NotStarted,
    Running,
    Suspended,
    Terminated,
}

enum FiberState {
    NotStarted(Option<FiberFuture>),
    Running,
    Suspended(FiberFuture),
    Terminated,
}

impl FiberState {
    fn status(&self) -> FiberStatus {
        match self {
            FiberState::NotStarted(_) => FiberStatus::NotStarted,
            FiberState::Running => FiberStatus::Running,
            FiberState::Suspended(_) => FiberStatus::Suspended,
            FiberState::Terminated => FiberStatus::Terminated,
        }
    }
}

enum Resumption {
    Value(Option<Value>),
    Throw(anyhow::Error),
}

struct FiberCore {
    label: String,
    state: RefCell<FiberState>,
    inbound: RefCell<Option<Resumption>>,
    outbound: RefCell<Option<Value>>,
}

/// Handle to a suspendable task. Clones share the same task.
#[derive(Clone)]
pub struct Fiber {
    core: Rc<FiberCore>,
}

impl Fiber {
    /// Creates a fiber that has not started yet.
    pub fn new<F>(label: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + 'static,
    {
        let fiber = Self::unbound(label.into());
        *fiber.core.state.borrow_mut() = FiberState::NotStarted(Some(future.boxed_local()));
        fiber
    }

    /// Creates a fiber whose future needs the fiber's own handle, for example to suspend itself.
    pub fn try_with<F>(label: impl Into<String>, build: F) -> Result<Self>
    where
        F: FnOnce(Fiber) -> Result<FiberFuture>,
    {
        let fiber = Self::unbound(label.into());
        let future = build(fiber.clone())?;
        *fiber.core.state.borrow_mut() = FiberState::NotStarted(Some(future));
        Ok(fiber)
    }

    fn unbound(label: String) -> Self {
        Self {
            core: Rc::new(FiberCore {
                label,
                state: RefCell::new(FiberState::NotStarted(None)),
                inbound: RefCell::new(None),
                outbound: RefCell::new(None),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }

    pub fn status(&self) -> FiberStatus {
        self.core.state.borrow().status()
    }

    pub fn is_started(&self) -> bool {
        self.status() != FiberStatus::NotStarted
    }

    pub fn is_running(&self) -> bool {
        self.status() == FiberStatus::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.status() == FiberStatus::Suspended
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == FiberStatus::Terminated
    }

    /// Whether both handles drive the same task.
    pub fn ptr_eq(&self, other: &Fiber) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// Runs the task until its first suspension.
    ///
    /// Returns the value passed to that suspension, or `None` when the task ran to completion.
    pub fn start(&self) -> Result<Option<Value>> {
        if !matches!(&*self.core.state.borrow(), FiberState::NotStarted(Some(_))) {
            return Err(self.lifecycle_error("start", "it was already started"));
        }
        debug!(fiber = %self.label(), "coroutine started");
        self.drive()
    }

    /// Resumes a suspended task; `value` becomes the output of its pending `suspend`.
    pub fn resume(&self, value: Option<Value>) -> Result<Option<Value>> {
        self.ensure_suspended("resume")?;
        *self.core.inbound.borrow_mut() = Some(Resumption::Value(value));
        self.drive()
    }

    /// Resumes a suspended task by making its pending `suspend` fail with `error`.
    pub fn throw(&self, error: anyhow::Error) -> Result<Option<Value>> {
        self.ensure_suspended("throw into")?;
        debug!(fiber = %self.label(), error = %error, "injecting error into coroutine");
        *self.core.inbound.borrow_mut() = Some(Resumption::Throw(error));
        self.drive()
    }

    /// Yields control back to whoever started or resumed this fiber.
    pub fn suspend(&self, value: Option<Value>) -> Suspend {
        Suspend {
            fiber: self.clone(),
            value,
            yielded: false,
        }
    }

    fn ensure_suspended(&self, operation: &str) -> Result<()> {
        match self.status() {
            FiberStatus::Suspended => Ok(()),
            FiberStatus::NotStarted => Err(self.lifecycle_error(operation, "it was never started")),
            FiberStatus::Running => Err(self.lifecycle_error(operation, "it is already running")),
            FiberStatus::Terminated => Err(self.lifecycle_error(operation, "it has terminated")),
        }
    }

    fn lifecycle_error(&self, operation: &str, reason: &str) -> RecipeError {
        RecipeError::fiber(self.label(), operation, reason)
    }

    fn drive(&self) -> Result<Option<Value>> {
        let previous = std::mem::replace(&mut *self.core.state.borrow_mut(), FiberState::Running);
        let mut future = match previous {
            FiberState::NotStarted(Some(future)) | FiberState::Suspended(future) => future,
            other => {
                *self.core.state.borrow_mut() = other;
                return Err(self.lifecycle_error("run", "it has nothing to run"));
            }
        };

        let mut context = Context::from_waker(noop_waker_ref());
        match future.as_mut().poll(&mut context) {
            Poll::Pending => {
                *self.core.state.borrow_mut() = FiberState::Suspended(future);
                debug!(fiber = %self.label(), "coroutine suspended");
                Ok(self.core.outbound.borrow_mut().take())
            }
            Poll::Ready(outcome) => {
                *self.core.state.borrow_mut() = FiberState::Terminated;
                self.core.inbound.borrow_mut().take();
                self.core.outbound.borrow_mut().take();
                debug!(fiber = %self.label(), failed = outcome.is_err(), "coroutine terminated");
                outcome.map(|()| None).map_err(RecipeError::from_step)
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("label", &self.label())
            .field("status", &self.status())
            .finish()
    }
}

/// Future returned by [`Fiber::suspend`].
///
/// Resolves with the value handed to [`Fiber::resume`], or fails with the error handed to
/// [`Fiber::throw`].
pub struct Suspend {
    fiber: Fiber,
    value: Option<Value>,
    yielded: bool,
}

impl Future for Suspend {
    type Output = anyhow::Result<Option<Value>>;

    fn poll(self: Pin<&mut Self>, _context: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.yielded {
            if !this.fiber.is_running() {
                return Poll::Ready(Err(anyhow!(this.fiber.lifecycle_error("suspend", "it is not running"))));
            }
            this.yielded = true;
            *this.fiber.core.outbound.borrow_mut() = this.value.take();
            return Poll::Pending;
        }

        match this.fiber.core.inbound.borrow_mut().take() {
            Some(Resumption::Value(value)) => Poll::Ready(Ok(value)),
            Some(Resumption::Throw(error)) => Poll::Ready(Err(error)),
            None => Poll::Pending,
        }
    }
}
