use std::{cell::RefCell, rc::Rc};

use brigade_engine::{
    Action, Chef, ChefStatus, Fiber, LoopControl, Mapping, Mergeable, Parameter, Recipe, RecipeError, Repeat,
    Supervisor, Value, Workplan,
};

type Log = Rc<RefCell<Vec<String>>>;

#[derive(Debug, Clone, Default, PartialEq)]
struct Counters(Vec<u32>);

impl Mergeable for Counters {
    fn merge(&mut self, other: Self) -> &mut Self {
        self.0.extend(other.0);
        self
    }
}

/// Coroutine step that suspends `rounds` times, handing its label out each time.
fn runner(rounds: u32) -> Action {
    Action::future(move |_chef, mut arguments| async move {
        let fiber = arguments.take::<Fiber>("fiber")?;
        let label = arguments.take::<String>("label")?;
        for _ in 0..rounds {
            fiber.suspend(Some(Value::new(label.clone()))).await?;
        }
        anyhow::Ok(())
    })
    .parameter(Parameter::of::<Fiber>("fiber"))
    .parameter(Parameter::of::<String>("label"))
}

fn label_of(value: Option<Value>) -> Option<String> {
    value.and_then(|value| value.downcast::<String>().ok())
}

#[test]
fn coroutine_steps_take_turns_under_the_supervisor() {
    let supervisor = Supervisor::new();
    let mut recipe = Recipe::new();
    for label in ["a", "b", "c"] {
        recipe = recipe.cook_in_fiber(label, runner(3), Mapping::new().literal("label", label.to_string()));
    }

    let chef = Chef::new().with_supervisor(supervisor.clone());
    chef.read(&recipe).expect("read");
    chef.process(Workplan::new()).expect("process");
    assert_eq!(chef.status(), ChefStatus::Free);
    assert_eq!(supervisor.fiber_count(), 3);

    let turns: Vec<_> = (0..4)
        .map(|_| label_of(supervisor.switch(None).expect("switch")))
        .collect();
    assert_eq!(
        turns,
        vec![Some("a".into()), Some("b".into()), Some("c".into()), Some("a".into())]
    );

    supervisor.finish(None).expect("finish");
    assert!(supervisor.is_empty());
}

#[test]
fn coroutine_steps_that_finish_at_once_leave_the_supervisor() {
    let supervisor = Supervisor::new();
    let recipe = Recipe::new()
        .cook_in_fiber("a", runner(2), Mapping::new().literal("label", "a".to_string()))
        .cook_in_fiber("quick", runner(0), Mapping::new().literal("label", "quick".to_string()))
        .cook_in_fiber("c", runner(2), Mapping::new().literal("label", "c".to_string()));

    let chef = Chef::new().with_supervisor(supervisor.clone());
    chef.read(&recipe).expect("read");
    chef.process(Workplan::new()).expect("process");
    assert_eq!(supervisor.fiber_count(), 2);

    let turns: Vec<_> = (0..2)
        .map(|_| label_of(supervisor.switch(None).expect("switch")))
        .collect();
    assert_eq!(turns, vec![Some("a".into()), Some("c".into())]);

    supervisor.finish(None).expect("finish");
    assert!(supervisor.is_empty());
}

#[test]
fn errors_thrown_into_a_coroutine_step_can_be_caught() {
    let log: Log = Rc::default();
    let sink = log.clone();
    let guarded = Action::future(move |_chef, mut arguments| {
        let sink = sink.clone();
        async move {
            let fiber = arguments.take::<Fiber>("fiber")?;
            if let Err(error) = fiber.suspend(None).await {
                sink.borrow_mut().push(format!("caught:{error}"));
            }
            anyhow::Ok(())
        }
    })
    .parameter(Parameter::of::<Fiber>("fiber"));

    let supervisor = Supervisor::new();
    let chef = Chef::new().with_supervisor(supervisor.clone());
    chef.read(&Recipe::new().cook_in_fiber("guarded", guarded, Mapping::new()))
        .expect("read");
    chef.process(Workplan::new()).expect("process");

    supervisor.throw(anyhow::anyhow!("cancel")).expect("delivered");
    assert_eq!(*log.borrow(), vec!["caught:cancel"]);
    assert!(supervisor.is_empty());
}

#[test]
fn suspending_outside_a_coroutine_is_reported() {
    let stuck = Action::future(|_chef, _arguments| async {
        futures_util::future::pending::<()>().await;
        anyhow::Ok(())
    });
    let chef = Chef::new();
    chef.read(&Recipe::new().cook("stuck", stuck)).expect("read");

    let error = chef.process(Workplan::new()).expect_err("suspended");
    assert!(matches!(error, RecipeError::SuspendedOutsideFiber));
    assert_eq!(chef.status(), ChefStatus::Free);
}

#[test]
fn fiber_parameters_need_a_running_coroutine() {
    let chef = Chef::new();
    chef.read(&Recipe::new().cook("plain", runner(1))).expect("read");
    let error = chef
        .process(Workplan::new().with("label", "x".to_string()))
        .expect_err("no coroutine");
    assert!(matches!(error, RecipeError::Binding { ref parameter, .. } if parameter == "fiber"));
}

#[test]
fn sub_recipes_repeat_and_report_through_the_parent() {
    let visit = Action::new(|chef, arguments| {
        let visits = *arguments.get::<u32>("visits")?;
        chef.update_work_plan(Workplan::new().with("scratch", true))?;
        let parent = chef.parent().ok_or_else(|| anyhow::anyhow!("no parent chef"))?;
        parent.update_work_plan(Workplan::new().with("visits", visits + 1))?;
        Ok(())
    })
    .parameter(Parameter::of::<u32>("visits"));
    let visitor = Recipe::new().cook("visit", visit);

    let chef = Chef::new();
    chef.read(&Recipe::new().execute("visit-three-times", &visitor, 3_u32))
        .expect("read");
    chef.process(Workplan::new().with("visits", 0_u32)).expect("process");

    assert_eq!(chef.get::<u32>("visits").expect("workplan"), Some(3));
    // Child writes stay in the child's copy.
    assert_eq!(chef.get::<bool>("scratch").expect("workplan"), None);
}

#[test]
fn zero_repeats_skip_the_sub_recipe() {
    let log: Log = Rc::default();
    let sink = log.clone();
    let visitor = Recipe::new().cook(
        "visit",
        Action::new(move |_chef, _arguments| {
            sink.borrow_mut().push("visit".into());
            Ok(())
        }),
    );
    let chef = Chef::new();
    chef.read(&Recipe::new().execute("never", &visitor, 0_u32)).expect("read");
    chef.process(Workplan::new()).expect("process");
    assert!(log.borrow().is_empty());
}

#[test]
fn controllers_see_a_one_based_counter_and_stop_the_loop() {
    let iterations = Rc::new(RefCell::new(0_u32));
    let body = {
        let iterations = iterations.clone();
        Action::new(move |_chef, _arguments| {
            *iterations.borrow_mut() += 1;
            Ok(())
        })
    };
    let controller = Action::new(|chef, arguments| {
        let counter = *arguments.get::<u32>("counter")?;
        chef.merge("seen", Counters(vec![counter]))?;
        if counter == 3 {
            arguments.get::<LoopControl>("bowl")?.stop_looping();
        }
        Ok(())
    })
    .parameter(Parameter::of::<u32>("counter"))
    .parameter(Parameter::of::<LoopControl>("bowl"));

    let chef = Chef::new();
    chef.read(&Recipe::new().execute("loop", &Recipe::new().cook("body", body), Repeat::until(controller)))
        .expect("read");
    chef.process(Workplan::new().with("seen", Counters::default()))
        .expect("process");

    assert_eq!(*iterations.borrow(), 3);
    assert_eq!(chef.get::<Counters>("seen").expect("workplan"), Some(Counters(vec![1, 2, 3])));
}

#[test]
fn sub_recipes_in_a_coroutine_resume_under_the_supervisor() {
    let log: Log = Rc::default();
    let note = |entry: &'static str| {
        let log = log.clone();
        Action::new(move |_chef, _arguments| {
            log.borrow_mut().push(entry.into());
            Ok(())
        })
    };
    let pausing = {
        let log = log.clone();
        Action::future(move |_chef, mut arguments| {
            let log = log.clone();
            async move {
                let fiber = arguments.take::<Fiber>("fiber")?;
                log.borrow_mut().push("tick".into());
                fiber.suspend(None).await?;
                log.borrow_mut().push("resumed".into());
                anyhow::Ok(())
            }
        })
        .parameter(Parameter::of::<Fiber>("fiber"))
    };
    let recipe = Recipe::new()
        .cook("before", note("before"))
        .execute_with("ticks", &Recipe::new().cook("pause", pausing), 2_u32, None, true)
        .cook("after", note("after"));

    let supervisor = Supervisor::new();
    let chef = Chef::new().with_supervisor(supervisor.clone());
    chef.read(&recipe).expect("read");
    chef.process(Workplan::new()).expect("process");
    assert_eq!(*log.borrow(), vec!["before", "tick", "after"]);

    supervisor.finish(None).expect("finish");
    assert_eq!(*log.borrow(), vec!["before", "tick", "after", "resumed", "tick", "resumed"]);
    assert!(supervisor.is_empty());
}

#[test]
fn unstarted_coroutines_stall_the_supervisor() {
    let supervisor = Supervisor::new();
    let idle = Fiber::new("idle", async { anyhow::Ok(()) });
    supervisor.supervise(&idle).expect("supervise");
    let error = supervisor.finish(None).expect_err("stalled");
    assert!(matches!(error, RecipeError::SupervisorStalled { pending: 1 }));
}
