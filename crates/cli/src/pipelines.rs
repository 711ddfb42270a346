//! Built-in demo pipelines.

use anyhow::{Context, Result, anyhow};
use brigade_engine::{
    Action, Chef, ChefSettings, DishClass, Fiber, LoopControl, Mapping, Mergeable, Parameter, Recipe, Repeat, Require,
    Supervisor, Workplan,
};
use tracing::{debug, info};

/// Values recorded in arrival order; merging appends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger<T>(pub Vec<T>);

impl<T> Mergeable for Ledger<T> {
    fn merge(&mut self, other: Self) -> &mut Self {
        self.0.extend(other.0);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountdownReport {
    pub from: i64,
    pub remaining: i64,
    pub ticks: Vec<i64>,
}

/// Counts down from `from` in a sub-recipe.
///
/// With `repeat` the sub-recipe runs that many times; without it a controller stops the
/// loop once the count reaches zero. Every iteration reports back through the parent chef.
pub fn countdown(settings: ChefSettings, from: i64, repeat: Option<u32>) -> Result<CountdownReport> {
    let tick = Action::new(|chef, arguments| {
        let remaining = *arguments.get::<i64>("remaining")?;
        let parent = chef.parent().context("countdown tick runs without a parent chef")?;
        if remaining <= 0 {
            debug!("countdown already at zero");
            return Ok(());
        }
        parent.update_work_plan(Workplan::new().with("remaining", remaining - 1))?;
        parent.merge("ticks", Ledger(vec![remaining]))?;
        info!(remaining = remaining - 1, "tick");
        Ok(())
    })
    .parameter(Parameter::of::<i64>("remaining"));
    let ticker = Recipe::new().cook("tick", tick);

    let repeat = match repeat {
        Some(times) => Repeat::Times(times),
        None => Repeat::until(
            Action::new(|chef, arguments| {
                let control = arguments.get::<LoopControl>("control")?;
                let remaining = chef.get::<i64>("remaining")?.unwrap_or_default();
                if remaining <= 0 {
                    control.stop_looping();
                }
                Ok(())
            })
            .parameter(Parameter::of::<LoopControl>("control")),
        ),
    };

    let start = Action::new(|chef, arguments| {
        let from = *arguments.get::<i64>("from")?;
        chef.update_work_plan(
            Workplan::new()
                .with("remaining", from)
                .with("ticks", Ledger::<i64>::default()),
        )?;
        Ok(())
    })
    .parameter(Parameter::of::<i64>("from"));

    let serve = Action::new(|chef, arguments| {
        chef.finish(CountdownReport {
            from: *arguments.get::<i64>("from")?,
            remaining: *arguments.get::<i64>("remaining")?,
            ticks: arguments.take::<Ledger<i64>>("ticks")?.0,
        })?;
        Ok(())
    })
    .parameter(Parameter::of::<i64>("from"))
    .parameter(Parameter::of::<i64>("remaining"))
    .parameter(Parameter::of::<Ledger<i64>>("ticks"));

    let recipe = Recipe::new()
        .require(Require::<i64>::new("from").normalize_with(|from| {
            anyhow::ensure!(from >= 0, "countdown must start at zero or above, got {from}");
            Ok(from)
        }))
        .cook("start", start)
        .execute("countdown", &ticker, repeat)
        .cook("serve", serve)
        .given(DishClass::<CountdownReport>::new());

    let chef = Chef::new().with_settings(settings);
    chef.read(&recipe)?;
    let dish = chef.process(Workplan::new().with("from", from))?;
    dish.context("countdown finished without a report")?
        .downcast::<CountdownReport>()
        .map_err(|value| anyhow!("countdown produced {}", value.type_name()))
}

/// Runs `fibers` coroutine steps that each take `rounds` turns with the baton.
///
/// Returns the baton log in the order the supervisor handed out turns.
pub fn relay(settings: ChefSettings, fibers: u32, rounds: u32) -> Result<Vec<String>> {
    let run = Action::future(|chef, mut arguments| async move {
        let fiber = arguments.take::<Fiber>("fiber")?;
        let runner = arguments.take::<String>("runner")?;
        let rounds = arguments.take::<u32>("rounds")?;
        for round in 1..=rounds {
            chef.merge("baton", Ledger(vec![format!("{runner}:{round}")]))?;
            fiber.suspend(None).await?;
        }
        debug!(%runner, "runner done");
        anyhow::Ok(())
    })
    .parameter(Parameter::of::<Fiber>("fiber"))
    .parameter(Parameter::of::<String>("runner"))
    .parameter(Parameter::of::<u32>("rounds"));

    let mut recipe = Recipe::new().require(Require::<u32>::new("rounds").or_default(1));
    for index in 1..=fibers {
        let runner = format!("runner-{index}");
        recipe = recipe.cook_in_fiber(&runner, run.clone(), Mapping::new().literal("runner", runner.clone()));
    }

    let supervisor = Supervisor::new();
    let chef = Chef::new().with_settings(settings).with_supervisor(supervisor.clone());
    chef.read(&recipe)?;
    chef.process(
        Workplan::new()
            .with("rounds", rounds)
            .with("baton", Ledger::<String>::default()),
    )?;
    info!(coroutines = supervisor.fiber_count(), "relay started");
    supervisor.finish(None)?;

    Ok(chef.get::<Ledger<String>>("baton")?.unwrap_or_default().0)
}
