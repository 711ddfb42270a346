//! Round-robin driver for suspended coroutines.
//!
//! A [`Supervisor`] keeps an ordered list of coroutines and nested supervisors. Nested
//! supervisors mirror the executor spawn tree: a sub-pipeline running in a coroutine gets a
//! child supervisor, and that child must [`free`](Supervisor::free) itself from its parent once
//! it has drained.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use tracing::{debug, warn};

use crate::{
    error::{RecipeError, Result},
    fiber::{Fiber, FiberStatus},
    workplan::Value,
};

#[derive(Clone)]
enum Supervised {
    Fiber(Fiber),
    Supervisor(Supervisor),
}

struct SupervisorCore {
    items: RefCell<Vec<Supervised>>,
    cursor: Cell<usize>,
    parent: RefCell<Weak<SupervisorCore>>,
}

/// Handle to one node of the supervisor tree. Clones share the node.
#[derive(Clone)]
pub struct Supervisor {
    core: Rc<SupervisorCore>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            core: Rc::new(SupervisorCore {
                items: RefCell::new(Vec::new()),
                cursor: Cell::new(0),
                parent: RefCell::new(Weak::new()),
            }),
        }
    }

    /// Creates a supervisor already managed by `parent`.
    pub fn child_of(parent: &Supervisor) -> Result<Self> {
        let child = Self::new();
        parent.manage(&child)?;
        Ok(child)
    }

    pub fn ptr_eq(&self, other: &Supervisor) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    pub fn parent(&self) -> Option<Supervisor> {
        self.core.parent.borrow().upgrade().map(|core| Supervisor { core })
    }

    pub fn len(&self) -> usize {
        self.core.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.items.borrow().is_empty()
    }

    /// Number of coroutines tracked directly by this node, excluding nested supervisors.
    pub fn fiber_count(&self) -> usize {
        self.core
            .items
            .borrow()
            .iter()
            .filter(|item| matches!(item, Supervised::Fiber(_)))
            .count()
    }

    /// Registers a coroutine. Starting it remains the caller's job.
    ///
    /// A running coroutine cannot be registered: the supervisor would end up resuming the
    /// code that is currently driving it.
    pub fn supervise(&self, fiber: &Fiber) -> Result<()> {
        if fiber.is_running() {
            return Err(RecipeError::supervisor_misuse(format!(
                "coroutine '{}' is running and cannot be supervised",
                fiber.label()
            )));
        }
        let mut items = self.core.items.borrow_mut();
        if items.iter().any(|item| matches!(item, Supervised::Fiber(tracked) if tracked.ptr_eq(fiber))) {
            return Ok(());
        }
        debug!(fiber = %fiber.label(), tracked = items.len() + 1, "supervising coroutine");
        items.push(Supervised::Fiber(fiber.clone()));
        Ok(())
    }

    /// Registers a nested supervisor and makes `self` its parent.
    pub fn manage(&self, child: &Supervisor) -> Result<()> {
        if self.ptr_eq(child) {
            return Err(RecipeError::supervisor_misuse("a supervisor cannot manage itself"));
        }
        let mut ancestor = self.parent();
        while let Some(node) = ancestor {
            if node.ptr_eq(child) {
                return Err(RecipeError::supervisor_misuse("managing an ancestor would create a cycle"));
            }
            ancestor = node.parent();
        }
        if let Some(previous) = child.parent()
            && !previous.ptr_eq(self)
        {
            previous.free(child);
        }

        let mut items = self.core.items.borrow_mut();
        if !items.iter().any(|item| matches!(item, Supervised::Supervisor(node) if node.ptr_eq(child))) {
            items.push(Supervised::Supervisor(child.clone()));
        }
        *child.core.parent.borrow_mut() = Rc::downgrade(&self.core);
        debug!(tracked = items.len(), "managing nested supervisor");
        Ok(())
    }

    /// Deregisters a nested supervisor.
    pub fn free(&self, child: &Supervisor) {
        let removed = self.remove_where(|item| matches!(item, Supervised::Supervisor(node) if node.ptr_eq(child)));
        if removed {
            let is_ours = child.parent().is_some_and(|parent| parent.ptr_eq(self));
            if is_ours {
                *child.core.parent.borrow_mut() = Weak::new();
            }
            debug!(tracked = self.len(), "freed nested supervisor");
        }
    }

    /// Drops a coroutine that terminated while its starter was still driving it.
    pub(crate) fn release(&self, fiber: &Fiber) {
        if fiber.is_terminated() {
            self.remove_fiber(fiber);
        }
    }

    /// Resets the cursor to the head of the list without resuming anything.
    pub fn rewind_loop(&self) {
        self.core.cursor.set(0);
    }

    /// Resumes the item under the cursor and advances it.
    ///
    /// Suspended coroutines are resumed with `value` and dropped from the list once they
    /// terminate; nested supervisors run one [`run_loop`](Supervisor::run_loop) pass.
    /// Coroutines that were never started are skipped. Returns what the resumed coroutine
    /// passed to its next suspension.
    pub fn switch(&self, value: Option<Value>) -> Result<Option<Value>> {
        let Some(item) = self.next_item() else {
            return Ok(None);
        };
        match item {
            Supervised::Fiber(fiber) => self.resume_fiber(&fiber, value),
            Supervised::Supervisor(child) => {
                child.run_loop(value)?;
                Ok(None)
            }
        }
    }

    /// Injects `error` into the next suspended coroutine, searching nested supervisors too.
    ///
    /// Returns what the coroutine passed to its next suspension. When nothing is able to
    /// receive the error it is dropped with a warning.
    pub fn throw(&self, error: anyhow::Error) -> Result<Option<Value>> {
        match self.deliver(error) {
            Ok(outcome) => outcome,
            Err(undelivered) => {
                warn!(error = %undelivered, "no suspended coroutine could receive the error");
                Ok(None)
            }
        }
    }

    /// One full pass over the list, from the head.
    ///
    /// Items registered during the pass are visited if they are appended before the cursor
    /// reaches the end.
    pub fn run_loop(&self, value: Option<Value>) -> Result<()> {
        self.rewind_loop();
        while self.core.cursor.get() < self.len() {
            self.switch(value.clone())?;
        }
        Ok(())
    }

    /// Drives every item to termination, then frees this node from its parent.
    ///
    /// Nested supervisors are finished recursively. Fails when a full pass makes no
    /// progress, for example when only unstarted coroutines remain.
    pub fn finish(&self, value: Option<Value>) -> Result<()> {
        while !self.is_empty() {
            self.rewind_loop();
            let mut progressed = false;
            while self.core.cursor.get() < self.len() {
                let Some(item) = self.next_item() else {
                    break;
                };
                match item {
                    Supervised::Fiber(fiber) => match fiber.status() {
                        FiberStatus::Suspended | FiberStatus::Terminated => {
                            progressed = true;
                            self.resume_fiber(&fiber, value.clone())?;
                        }
                        FiberStatus::NotStarted | FiberStatus::Running => {}
                    },
                    Supervised::Supervisor(child) => {
                        progressed = true;
                        child.finish(value.clone())?;
                        // A drained child frees itself; one left behind by a stale parent link is dropped here.
                        self.free(&child);
                    }
                }
            }
            if !progressed {
                let pending = self.len();
                warn!(pending, "supervisor cannot make progress");
                return Err(RecipeError::SupervisorStalled { pending });
            }
        }

        if let Some(parent) = self.parent() {
            parent.free(self);
        }
        Ok(())
    }

    fn next_item(&self) -> Option<Supervised> {
        let items = self.core.items.borrow();
        if items.is_empty() {
            return None;
        }
        let mut index = self.core.cursor.get();
        if index >= items.len() {
            index = 0;
        }
        self.core.cursor.set(index + 1);
        Some(items[index].clone())
    }

    fn resume_fiber(&self, fiber: &Fiber, value: Option<Value>) -> Result<Option<Value>> {
        let outcome = match fiber.status() {
            FiberStatus::Suspended => fiber.resume(value),
            FiberStatus::Terminated => Ok(None),
            FiberStatus::NotStarted | FiberStatus::Running => return Ok(None),
        };
        if fiber.is_terminated() {
            self.remove_fiber(fiber);
        }
        outcome
    }

    fn deliver(&self, mut error: anyhow::Error) -> std::result::Result<Result<Option<Value>>, anyhow::Error> {
        for _ in 0..self.len() {
            let Some(item) = self.next_item() else {
                break;
            };
            match item {
                Supervised::Fiber(fiber) if fiber.is_suspended() => {
                    let outcome = fiber.throw(error);
                    if fiber.is_terminated() {
                        self.remove_fiber(&fiber);
                    }
                    return Ok(outcome);
                }
                Supervised::Fiber(fiber) if fiber.is_terminated() => self.remove_fiber(&fiber),
                Supervised::Fiber(_) => {}
                Supervised::Supervisor(child) => match child.deliver(error) {
                    Ok(outcome) => return Ok(outcome),
                    Err(undelivered) => error = undelivered,
                },
            }
        }
        Err(error)
    }

    fn remove_fiber(&self, fiber: &Fiber) {
        if self.remove_where(|item| matches!(item, Supervised::Fiber(tracked) if tracked.ptr_eq(fiber))) {
            debug!(fiber = %fiber.label(), tracked = self.len(), "released terminated coroutine");
        }
    }

    fn remove_where(&self, predicate: impl Fn(&Supervised) -> bool) -> bool {
        let mut items = self.core.items.borrow_mut();
        let Some(index) = items.iter().position(predicate) else {
            return false;
        };
        items.remove(index);
        let cursor = self.core.cursor.get();
        if index < cursor {
            self.core.cursor.set(cursor - 1);
        }
        true
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("items", &self.len())
            .field("cursor", &self.core.cursor.get())
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}
