//! Binder that runs its step inside a fresh coroutine.

use std::cell::RefCell;

use futures_util::{FutureExt, future::LocalBoxFuture};
use tracing::{debug, warn};

use super::{Action, Binder, Bowl, Mapping, Scope};
use crate::{
    chef::Chef,
    error::Result,
    fiber::Fiber,
    supervisor::Supervisor,
    workplan::Workplan,
};

/// Runs an action as a coroutine.
///
/// The coroutine is registered with the active supervisor before it starts, so once the
/// step suspends the pipeline moves on and the supervisor decides when the step resumes.
/// Parameters typed [`Fiber`] or [`Supervisor`] bind the new coroutine and that supervisor.
pub struct FiberBowl {
    name: String,
    action: Action,
    binder: Binder,
}

impl FiberBowl {
    pub fn new(name: impl Into<String>, action: Action, mapping: Mapping) -> Self {
        Self {
            name: name.into(),
            action,
            binder: Binder::new(mapping),
        }
    }
}

impl Bowl for FiberBowl {
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
            let supervisor = supervisor.cloned().or_else(|| chef.supervisor());
            let fiber = Fiber::try_with(self.name.as_str(), |fiber| {
                let scope = Scope {
                    chef,
                    fiber: Some(fiber),
                    supervisor: supervisor.clone(),
                };
                let arguments = self.binder.bind(&self.name, &self.action, &scope, workplan)?;
                let action = self.action.clone();
                let chef = chef.clone();
                Ok(async move { action.invoke(&chef, arguments).await }.boxed_local())
            })?;

            match &supervisor {
                Some(supervisor) => supervisor.supervise(&fiber)?,
                None => warn!(step = %self.name, "coroutine step has no supervisor; nothing will resume it"),
            }
            let started = fiber.start();
            if fiber.is_suspended() {
                debug!(step = %self.name, "coroutine step suspended");
            } else if let Some(supervisor) = &supervisor {
                supervisor.release(&fiber);
            }
            started.map(|_| ())
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{bowl::Parameter, error::RecipeError};

    #[test]
    fn step_suspends_and_resumes_through_the_supervisor() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let action = Action::future(move |_chef, mut arguments| {
            let sink = sink.clone();
            async move {
                let fiber = arguments.take::<Fiber>("fiber")?;
                sink.borrow_mut().push("before");
                fiber.suspend(None).await?;
                sink.borrow_mut().push("after");
                anyhow::Ok(())
            }
        })
        .parameter(Parameter::of::<Fiber>("fiber"));

        let bowl = FiberBowl::new("pausing", action, Mapping::new());
        let supervisor = Supervisor::new();
        let chef = Chef::new();
        let workplan = RefCell::new(Workplan::new());

        bowl.execute(&chef, &workplan, Some(&supervisor))
            .now_or_never()
            .expect("a coroutine step never blocks its caller")
            .expect("step");
        assert_eq!(*log.borrow(), vec!["before"]);
        assert_eq!(supervisor.fiber_count(), 1);

        supervisor.switch(None).expect("resume");
        assert_eq!(*log.borrow(), vec!["before", "after"]);
        assert!(supervisor.is_empty());
    }

    #[test]
    fn failing_steps_are_not_left_with_the_supervisor() {
        let action = Action::future(|_chef, _arguments| async { Err::<(), _>(anyhow::anyhow!("boom")) });
        let bowl = FiberBowl::new("failing", action, Mapping::new());
        let supervisor = Supervisor::new();
        bowl.execute(&Chef::new(), &RefCell::new(Workplan::new()), Some(&supervisor))
            .now_or_never()
            .expect("ready")
            .expect_err("step error");
        assert!(supervisor.is_empty());
    }

    #[test]
    fn binding_failures_surface_before_the_coroutine_exists() {
        let action = Action::new(|_, _| Ok(())).parameter(Parameter::of::<i64>("n"));
        let bowl = FiberBowl::new("needs-n", action, Mapping::new());
        let supervisor = Supervisor::new();
        let error = bowl
            .execute(&Chef::new(), &RefCell::new(Workplan::new()), Some(&supervisor))
            .now_or_never()
            .expect("ready")
            .expect_err("unbound");
        assert!(matches!(error, RecipeError::Binding { .. }));
        assert!(supervisor.is_empty());
    }
}
