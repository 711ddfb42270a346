//! The executor ("chef").
//!
//! A [`Chef`] is trained with a [`Recipe`], owns the workplan and dispatches the compiled
//! steps one after another. Steps reach back into the chef (it binds to any parameter typed
//! `Chef`) to update the workplan, jump to a named step, raise an error into the handler
//! chain or finish the cycle.
//!
//! The chef is a cheap handle over shared state, so suspended coroutines and nested
//! sub-recipes can hold on to it. Borrows of that state are never held across a step call.

mod state;

use std::{
    any::Any,
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use futures_util::FutureExt;
use tracing::{debug, info, warn};

pub use self::state::ChefStatus;
use self::state::{ChefState, Cooking};
use crate::{
    ERROR_KEY,
    error::{MissingIngredient, RecipeError, Result},
    fiber::Fiber,
    recipe::{CompiledStep, Recipe},
    settings::ChefSettings,
    supervisor::Supervisor,
    workplan::{Mergeable, Value, Workplan},
};

struct Kitchen {
    state: RefCell<ChefState>,
    workplan: RefCell<Workplan>,
    missing: RefCell<Vec<MissingIngredient>>,
    supervisor: RefCell<Option<Supervisor>>,
    fiber: RefCell<Option<Fiber>>,
    settings: RefCell<ChefSettings>,
    parent: Weak<Kitchen>,
    depth: usize,
}

/// Handle to an executor. Clones share the same executor.
#[derive(Clone)]
pub struct Chef {
    kitchen: Rc<Kitchen>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Resume,
    Stop,
}

/// Returns the chef to `Free` when a cycle ends, including when its future is dropped mid-way.
struct CycleGuard<'a> {
    chef: &'a Chef,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.chef.end_cooking();
    }
}

impl Default for Chef {
    fn default() -> Self {
        Self::new()
    }
}

impl Chef {
    pub fn new() -> Self {
        Self::with_parent(Weak::new(), 0, ChefSettings::default(), None)
    }

    fn with_parent(parent: Weak<Kitchen>, depth: usize, settings: ChefSettings, supervisor: Option<Supervisor>) -> Self {
        Self {
            kitchen: Rc::new(Kitchen {
                state: RefCell::new(ChefState::Free),
                workplan: RefCell::new(Workplan::new()),
                missing: RefCell::new(Vec::new()),
                supervisor: RefCell::new(supervisor),
                fiber: RefCell::new(None),
                settings: RefCell::new(settings),
                parent,
                depth,
            }),
        }
    }

    /// Sets the supervisor handed to every step of this chef.
    pub fn with_supervisor(self, supervisor: Supervisor) -> Self {
        *self.kitchen.supervisor.borrow_mut() = Some(supervisor);
        self
    }

    /// Sets the coroutine this chef's steps run in.
    pub fn with_fiber(self, fiber: Option<Fiber>) -> Self {
        *self.kitchen.fiber.borrow_mut() = fiber;
        self
    }

    pub fn with_settings(self, settings: ChefSettings) -> Self {
        *self.kitchen.settings.borrow_mut() = settings;
        self
    }

    pub fn supervisor(&self) -> Option<Supervisor> {
        self.kitchen.supervisor.borrow().clone()
    }

    /// The coroutine this chef's steps run in, if any.
    pub fn fiber(&self) -> Option<Fiber> {
        self.kitchen.fiber.borrow().clone()
    }

    pub fn settings(&self) -> ChefSettings {
        self.kitchen.settings.borrow().clone()
    }

    /// The chef that spawned this one through [`Chef::reserve_and_begin`].
    pub fn parent(&self) -> Option<Chef> {
        self.kitchen.parent.upgrade().map(|kitchen| Chef { kitchen })
    }

    /// Nesting level: 0 for a top-level chef.
    pub fn depth(&self) -> usize {
        self.kitchen.depth
    }

    pub fn status(&self) -> ChefStatus {
        match self.kitchen.state.try_borrow() {
            Ok(state) => state.status(),
            Err(_) => ChefStatus::Cooking,
        }
    }

    pub fn ptr_eq(&self, other: &Chef) -> bool {
        Rc::ptr_eq(&self.kitchen, &other.kitchen)
    }

    /// Trains this chef with `recipe`. Returns the compiled copy the chef now holds.
    pub fn read(&self, recipe: &Recipe) -> Result<Recipe> {
        recipe.train(self)
    }

    pub(crate) fn attach(&self, recipe: Recipe) -> Result<()> {
        let mut state = self.state_mut("train")?;
        if !matches!(*state, ChefState::Free) {
            return Err(RecipeError::invalid_state("train", state.status().to_string()));
        }
        *state = ChefState::Trained { recipe };
        Ok(())
    }

    /// Runs one cooking cycle to completion and returns the value passed to [`Chef::finish`].
    ///
    /// Fails with [`RecipeError::SuspendedOutsideFiber`] when a step suspends: use
    /// [`Chef::process_async`] inside a coroutine for recipes whose steps may suspend.
    pub fn process(&self, workplan: Workplan) -> Result<Option<Value>> {
        match self.process_async(workplan).now_or_never() {
            Some(outcome) => outcome,
            None => {
                warn!(depth = self.depth(), "cooking cycle suspended outside a coroutine");
                Err(RecipeError::SuspendedOutsideFiber)
            }
        }
    }

    /// Merges `workplan` into the chef's workplan and runs one cooking cycle.
    pub async fn process_async(&self, workplan: Workplan) -> Result<Option<Value>> {
        let (recipe, steps) = self.begin_cooking(workplan)?;
        let guard = CycleGuard { chef: self };
        info!(depth = self.depth(), steps = steps.len(), "cooking started");

        let outcome = self.cook(&recipe, &steps).await;
        let result = self.end_cooking();
        drop(guard);
        match outcome {
            Ok(()) => {
                info!(depth = self.depth(), finished = result.is_some(), "cooking finished");
                Ok(result)
            }
            Err(error) => {
                warn!(depth = self.depth(), error = %error, "cooking failed");
                Err(error)
            }
        }
    }

    /// Merges `updates` into the workplan and, when `next_step` is given, makes that step the
    /// next one to run.
    pub fn continue_with(&self, updates: Workplan, next_step: Option<&str>) -> Result<()> {
        let jump = self.with_cooking("continue", |cooking| match next_step {
            Some(name) => cooking.step_index(name).map(Some).ok_or_else(|| RecipeError::unknown_step(name)),
            None => Ok(None),
        })??;
        self.update_work_plan(updates)?;
        if let Some(index) = jump {
            self.with_cooking("continue", |cooking| cooking.jump = Some(index))?;
            debug!(depth = self.depth(), step = next_step.unwrap_or_default(), "jump scheduled");
        }
        Ok(())
    }

    /// Merges `updates` into the workplan without touching dispatch.
    pub fn update_work_plan(&self, updates: Workplan) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.workplan_mut()?.extend(updates);
        Ok(())
    }

    /// Merges `value` into the existing entry under `key`; never creates an entry.
    pub fn merge<T>(&self, key: &str, value: T) -> Result<()>
    where
        T: Mergeable + Any + Clone,
    {
        self.workplan_mut()?.merge(key, value)
    }

    pub fn clean_work_plan<I, S>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut workplan = self.workplan_mut()?;
        for key in keys {
            workplan.remove(key.as_ref());
        }
        Ok(())
    }

    /// Records an unmet input requirement. All of them are raised together once every
    /// ingredient has been checked.
    pub fn missing(&self, ingredient: &str, message: impl Into<String>) {
        let diagnostic = MissingIngredient {
            ingredient: ingredient.to_string(),
            message: message.into(),
        };
        debug!(ingredient = %diagnostic.ingredient, message = %diagnostic.message, "missing ingredient");
        self.kitchen.missing.borrow_mut().push(diagnostic);
    }

    /// Routes `error` to the error handlers once the current step returns.
    pub fn error(&self, error: impl Into<anyhow::Error>) -> Result<()> {
        let error = RecipeError::from_step(error.into());
        self.with_cooking("raise an error", |cooking| cooking.pending_error = Some(error))
    }

    /// Stops dispatch after the current step.
    pub fn interrupt_cooking(&self) -> Result<()> {
        self.with_cooking("interrupt", |cooking| cooking.interrupted = true)
    }

    /// Keeps the error being handled from re-raising once the handlers have run.
    pub fn stop_error_reporting(&self) -> Result<()> {
        self.with_cooking("stop error reporting", |cooking| cooking.error_reporting = false)
    }

    /// Creates a child chef trained with `recipe`. The child inherits this chef's settings and
    /// shares none of its state.
    pub fn reserve_and_begin(&self, recipe: &Recipe, supervisor: Option<&Supervisor>) -> Result<Chef> {
        let child = Chef::with_parent(
            Rc::downgrade(&self.kitchen),
            self.depth() + 1,
            self.settings(),
            supervisor.cloned(),
        );
        recipe.train(&child)?;
        debug!(depth = child.depth(), "child chef reserved");
        Ok(child)
    }

    /// Validates `value` against the recipe's expected output and ends the cycle after the
    /// current step.
    pub fn finish<T: Any + Clone>(&self, value: T) -> Result<()> {
        let recipe = self.with_cooking("finish", |cooking| cooking.recipe.clone())?;
        let value = Value::new(value);
        recipe.validate(&value)?;
        self.with_cooking("finish", |cooking| {
            cooking.finished = true;
            cooking.result = Some(value);
        })
    }

    /// Clone of the workplan entry under `key`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Result<Option<T>> {
        self.with_workplan(|workplan| workplan.get::<T>(key).cloned())
    }

    pub fn with_workplan<R>(&self, read: impl FnOnce(&Workplan) -> R) -> Result<R> {
        let workplan = self.kitchen.workplan.try_borrow().map_err(|_| RecipeError::WorkplanBusy)?;
        Ok(read(&workplan))
    }

    /// Copy of the whole workplan.
    pub fn snapshot(&self) -> Result<Workplan> {
        self.with_workplan(Workplan::clone)
    }

    pub(crate) fn workplan_cell(&self) -> &RefCell<Workplan> {
        &self.kitchen.workplan
    }

    fn workplan_mut(&self) -> Result<std::cell::RefMut<'_, Workplan>> {
        self.kitchen.workplan.try_borrow_mut().map_err(|_| RecipeError::WorkplanBusy)
    }

    fn state_mut(&self, operation: &str) -> Result<std::cell::RefMut<'_, ChefState>> {
        self.kitchen
            .state
            .try_borrow_mut()
            .map_err(|_| RecipeError::invalid_state(operation, "its state is in use"))
    }

    fn with_cooking<R>(&self, operation: &str, update: impl FnOnce(&mut Cooking) -> R) -> Result<R> {
        let mut state = self.state_mut(operation)?;
        match &mut *state {
            ChefState::Cooking(cooking) => Ok(update(cooking)),
            other => Err(RecipeError::invalid_state(operation, other.status().to_string())),
        }
    }

    fn begin_cooking(&self, initial: Workplan) -> Result<(Recipe, std::rc::Rc<[CompiledStep]>)> {
        let mut state = self.state_mut("process")?;
        let recipe = match &*state {
            ChefState::Trained { recipe } => recipe.clone(),
            other => return Err(RecipeError::invalid_state("process", other.status().to_string())),
        };
        self.workplan_mut()?.extend(initial);
        self.kitchen.missing.borrow_mut().clear();
        let steps = recipe.compiled_steps();
        *state = ChefState::Cooking(Box::new(Cooking::new(recipe.clone(), steps.clone())));
        Ok((recipe, steps))
    }

    fn end_cooking(&self) -> Option<Value> {
        let Ok(mut state) = self.kitchen.state.try_borrow_mut() else {
            return None;
        };
        if !matches!(*state, ChefState::Cooking(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, ChefState::Free) {
            ChefState::Cooking(cooking) => cooking.result,
            _ => None,
        }
    }

    async fn cook(&self, recipe: &Recipe, steps: &[CompiledStep]) -> Result<()> {
        let supervisor = self.supervisor();
        if let Err(error) = self.prepare(recipe)
            && self.recover(recipe, error, None, supervisor.as_ref()).await? == Flow::Stop
        {
            return Ok(());
        }

        let settings = self.settings();
        let mut dispatched = 0_u64;
        while let Some(index) = self.with_cooking("dispatch", Cooking::advance)? {
            if let Some(limit) = settings.max_dispatches
                && dispatched >= limit
            {
                warn!(depth = self.depth(), limit, "dispatch guard tripped");
                return Err(RecipeError::DispatchLimit { limit });
            }
            dispatched += 1;

            let step = &steps[index];
            debug!(depth = self.depth(), step = %step.name, index, "step dispatched");
            let outcome = step.bowl.execute(self, &self.kitchen.workplan, supervisor.as_ref()).await;
            let raised = self.take_pending_error()?;
            if settings.trace_workplan {
                let keys = self.with_workplan(|workplan| workplan.keys().map(str::to_string).collect::<Vec<_>>())?;
                debug!(depth = self.depth(), step = %step.name, keys = ?keys, "workplan after step");
            }

            let failure = match outcome {
                Err(error) => Some(error),
                Ok(()) => raised,
            };
            if let Some(error) = failure
                && self.recover(recipe, error, Some(&step.name), supervisor.as_ref()).await? == Flow::Stop
            {
                return Ok(());
            }
        }
        Ok(())
    }

    fn prepare(&self, recipe: &Recipe) -> Result<()> {
        recipe.prepare(&mut *self.workplan_mut()?, self)?;
        let missing = std::mem::take(&mut *self.kitchen.missing.borrow_mut());
        if missing.is_empty() {
            return Ok(());
        }
        warn!(depth = self.depth(), missing = missing.len(), "required ingredients are missing");
        Err(RecipeError::MissingIngredients(missing))
    }

    /// Runs the error handlers for `error`.
    ///
    /// Without handlers the error propagates unchanged. Otherwise it is stored under
    /// [`ERROR_KEY`] and every handler runs in order; the error then re-raises unless a
    /// handler stopped error reporting.
    async fn recover(
        &self,
        recipe: &Recipe,
        error: RecipeError,
        step: Option<&str>,
        supervisor: Option<&Supervisor>,
    ) -> Result<Flow> {
        let handlers = recipe.handlers();
        if handlers.is_empty() {
            return Err(error);
        }

        self.with_cooking("recover", |cooking| cooking.error_reporting = true)?;
        self.workplan_mut()?.insert(ERROR_KEY, error.clone());
        info!(
            depth = self.depth(),
            step = step.unwrap_or("<ingredients>"),
            handlers = handlers.len(),
            error = %error,
            "error handlers started"
        );

        for handler in handlers {
            handler.execute(self, &self.kitchen.workplan, supervisor).await?;
            if let Some(raised) = self.take_pending_error()? {
                return Err(raised);
            }
        }

        let (reporting, interrupted) = self.with_cooking("recover", |cooking| (cooking.error_reporting, cooking.interrupted))?;
        if reporting {
            return Err(error);
        }
        if interrupted {
            info!(depth = self.depth(), "cooking interrupted by an error handler");
            return Ok(Flow::Stop);
        }
        debug!(depth = self.depth(), "error handled silently; dispatch resumes");
        Ok(Flow::Resume)
    }

    fn take_pending_error(&self) -> Result<Option<RecipeError>> {
        self.with_cooking("dispatch", |cooking| cooking.pending_error.take())
    }
}

impl fmt::Debug for Chef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chef")
            .field("status", &self.status())
            .field("depth", &self.depth())
            .field("has_supervisor", &self.kitchen.supervisor.borrow().is_some())
            .field("has_fiber", &self.kitchen.fiber.borrow().is_some())
            .finish()
    }
}
