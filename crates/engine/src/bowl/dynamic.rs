//! Binder whose target is read from the workplan when the step runs.

use std::cell::RefCell;

use futures_util::{FutureExt, future::LocalBoxFuture};
use tracing::debug;

use super::{Action, Binder, Bowl, Mapping, Scope};
use crate::{
    chef::Chef,
    error::{RecipeError, Result},
    supervisor::Supervisor,
    workplan::Workplan,
};

/// Runs the [`Action`] stored under `key` at call time.
///
/// The binding plan is cached for the last action seen and recompiled when a step stores a
/// different action under the key.
pub struct DynamicBowl {
    name: String,
    key: String,
    throw_if_missing: bool,
    binder: Binder,
}

impl DynamicBowl {
    pub fn new(name: impl Into<String>, key: impl Into<String>, mapping: Mapping) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            throw_if_missing: true,
            binder: Binder::new(mapping),
        }
    }

    /// Skips the step instead of failing when no action is stored under the key.
    pub fn skip_if_missing(mut self) -> Self {
        self.throw_if_missing = false;
        self
    }

    fn current_action(&self, workplan: &RefCell<Workplan>) -> Result<Option<Action>> {
        let workplan = workplan.try_borrow().map_err(|_| RecipeError::WorkplanBusy)?;
        match workplan.value(&self.key) {
            None => Ok(None),
            Some(value) => value.downcast_ref::<Action>().cloned().map(Some).ok_or_else(|| {
                RecipeError::binding(&self.name, &self.key, format!("holds {}, not an action", value.type_name()))
            }),
        }
    }
}

impl Bowl for DynamicBowl {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        chef: &'a Chef,
        workplan: &'a RefCell<Workplan>,
        supervisor: Option<&'a Supervisor>,
    ) -> LocalBoxFuture<'a, Result<()>> {
        async move {
            let Some(action) = self.current_action(workplan)? else {
                if self.throw_if_missing {
                    return Err(RecipeError::binding(&self.name, &self.key, "has no action stored in the workplan"));
                }
                debug!(step = %self.name, key = %self.key, "dynamic step skipped");
                return Ok(());
            };
            let scope = Scope {
                chef,
                fiber: chef.fiber(),
                supervisor: supervisor.cloned(),
            };
            let arguments = self.binder.bind(&self.name, &action, &scope, workplan)?;
            action.invoke(chef, arguments).await.map_err(RecipeError::from_step)
        }
        .boxed_local()
    }
}
