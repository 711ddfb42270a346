//! Sub-recipe binder: runs a nested recipe in a child chef, optionally repeated.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use futures_util::{FutureExt, future::LocalBoxFuture};
use tracing::{debug, info, warn};

use super::{Action, Bowl, Mapping, StepBowl};
use crate::{
    chef::Chef,
    error::{RecipeError, Result},
    fiber::Fiber,
    recipe::Recipe,
    supervisor::Supervisor,
    workplan::Workplan,
};

/// Workplan key holding the 1-based iteration count seen by a repeat controller.
pub const COUNTER_KEY: &str = "counter";
/// Workplan key holding the [`LoopControl`] seen by a repeat controller.
pub const CONTROL_KEY: &str = "bowl";

/// How many times a sub-recipe runs.
#[derive(Clone)]
pub enum Repeat {
    /// Runs while the iteration count is below the given number.
    Times(u32),
    /// Runs the controller after every iteration until it calls [`LoopControl::stop_looping`].
    Until(Rc<dyn Bowl>),
}

impl Repeat {
    /// Wraps `controller` in a plain step binder.
    ///
    /// The controller resolves its parameters from a workplan holding [`COUNTER_KEY`] (a `u32`)
    /// and [`CONTROL_KEY`] (a [`LoopControl`]).
    pub fn until(controller: Action) -> Self {
        Self::Until(Rc::new(StepBowl::new("repeat", controller, Mapping::new())))
    }
}

impl Default for Repeat {
    fn default() -> Self {
        Self::Times(1)
    }
}

impl From<u32> for Repeat {
    fn from(times: u32) -> Self {
        Self::Times(times)
    }
}

/// Handle a repeat controller uses to end the loop after the current iteration.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    stopped: Rc<Cell<bool>>,
}

impl LoopControl {
    pub fn stop_looping(&self) {
        self.stopped.set(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}

#[derive(Clone)]
struct Looper {
    name: String,
    recipe: Recipe,
    repeat: Repeat,
}

impl Looper {
    async fn run(
        &self,
        chef: &Chef,
        workplan: &RefCell<Workplan>,
        supervisor: Option<&Supervisor>,
        fiber: Option<&Fiber>,
    ) -> Result<()> {
        let control = LoopControl::default();
        let mut counter = 0_u32;
        info!(step = %self.name, until = matches!(self.repeat, Repeat::Until(_)), "sub-recipe started");

        loop {
            if let Repeat::Times(times) = self.repeat
                && counter >= times
            {
                break;
            }

            let copy = workplan.try_borrow().map_err(|_| RecipeError::WorkplanBusy)?.clone();
            let child = chef.reserve_and_begin(&self.recipe, supervisor)?.with_fiber(fiber.cloned());
            child.process_async(copy).await?;
            counter += 1;
            debug!(step = %self.name, iteration = counter, "sub-recipe iteration finished");

            if let Repeat::Until(controller) = &self.repeat {
                let controller_workplan = RefCell::new(
                    Workplan::new()
                        .with(COUNTER_KEY, counter)
                        .with(CONTROL_KEY, control.clone())
                        .with_typed(control.clone()),
                );
                controller.execute(chef, &controller_workplan, supervisor).await?;
                if control.is_stopped() {
                    break;
                }
            }
        }

        info!(step = %self.name, iterations = counter, "sub-recipe finished");
        Ok(())
    }
}

/// Runs a nested recipe in a child chef.
///
/// Each iteration gets its own child chef and a copy of the current workplan; nothing flows
/// back automatically. Steps that need to report to the caller write through
/// [`Chef::parent`].
///
/// Inside a coroutine the whole loop runs in a new [`Fiber`] registered with the active
/// supervisor, and the child chefs get a nested supervisor that is drained when the loop ends.
pub struct RecipeBowl {
    looper: Looper,
    in_fiber: bool,
}

impl RecipeBowl {
    pub fn new(name: impl Into<String>, recipe: Recipe, repeat: impl Into<Repeat>) -> Self {
        Self {
            looper: Looper {
                name: name.into(),
                recipe,
                repeat: repeat.into(),
            },
            in_fiber: false,
        }
    }

    pub fn in_fiber(mut self, in_fiber: bool) -> Self {
        self.in_fiber = in_fiber;
        self
    }

    fn spawn_fiber(&self, chef: &Chef, supervisor: Option<&Supervisor>) -> Result<()> {
        let parent_supervisor = supervisor.cloned().or_else(|| chef.supervisor());
        let child_supervisor = match &parent_supervisor {
            Some(parent) => Supervisor::child_of(parent)?,
            None => Supervisor::new(),
        };

        let looper = self.looper.clone();
        let owner = chef.clone();
        let fiber = Fiber::try_with(format!("{}:loop", self.looper.name), move |fiber| {
            Ok(async move {
                let outcome = looper.run(&owner, owner.workplan_cell(), Some(&child_supervisor), Some(&fiber)).await;
                let drained = child_supervisor.finish(None);
                outcome?;
                drained?;
                anyhow::Ok(())
            }
            .boxed_local())
        })?;

        match &parent_supervisor {
            Some(parent) => parent.supervise(&fiber)?,
            None => warn!(step = %self.looper.name, "sub-recipe coroutine has no supervisor; nothing will resume it"),
        }
        let started = fiber.start();
        if fiber.is_suspended() {
            debug!(step = %self.looper.name, "sub-recipe coroutine suspended");
        } else if let Some(parent) = &parent_supervisor {
            parent.release(&fiber);
        }
        started.map(|_| ())
    }
}

impl Bowl for RecipeBowl {
    fn name(&self) -> &str {
        &self.looper.name
    }

    fn execute<'a>(
        &'a self,
        chef: &'a Chef,
        workplan: &'a RefCell<Workplan>,
        supervisor: Option<&'a Supervisor>,
    ) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            if self.in_fiber {
                return self.spawn_fiber(chef, supervisor);
            }
            let ambient = chef.fiber();
            self.looper.run(chef, workplan, supervisor, ambient.as_ref()).await
        }
        .boxed_local()
    }
}
