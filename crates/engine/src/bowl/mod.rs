//! Step binders ("bowls").
//!
//! A bowl wraps one step target and resolves the step's declared parameters from the
//! workplan before invoking it. Resolution follows a fixed order for every parameter:
//!
//! 1. a parameter typed [`Chef`] binds the executor itself (and, in a coroutine, [`Fiber`]
//!    and [`Supervisor`] typed parameters bind the running coroutine and active supervisor);
//! 2. a [`Mapping`] entry either binds a literal or renames the workplan key to look up;
//! 3. a workplan entry under the (possibly renamed) key binds, after an optional transform;
//! 4. a typed parameter binds the first workplan value of that type, in insertion order;
//! 5. the parameter default binds, otherwise resolution fails with a binding error.
//!
//! Rules 1 and 2 depend only on the parameter list and the mapping, so they are compiled
//! once into a [`BindingPlan`] that the bowl caches.

pub mod dynamic;
pub mod fiber;
pub mod sub_recipe;

use std::{
    any::{Any, TypeId, type_name},
    cell::RefCell,
    fmt,
    future::Future,
    rc::Rc,
};

use futures_util::{FutureExt, future::LocalBoxFuture};
use indexmap::IndexMap;
use tracing::debug;

use crate::{
    chef::Chef,
    error::{RecipeError, Result},
    fiber::Fiber,
    supervisor::Supervisor,
    workplan::{Value, Workplan},
};

pub use dynamic::DynamicBowl;
pub use fiber::FiberBowl;
pub use sub_recipe::{LoopControl, RecipeBowl, Repeat};

/// A step binder: resolves a target's arguments and runs it.
pub trait Bowl {
    /// Step label, used in diagnostics and as the target of named jumps.
    fn name(&self) -> &str;

    /// Resolves the target's arguments from `workplan` and runs it.
    fn execute<'a>(
        &'a self,
        chef: &'a Chef,
        workplan: &'a RefCell<Workplan>,
        supervisor: Option<&'a Supervisor>,
    ) -> LocalBoxFuture<'a, Result<()>>;
}

type SyncBody = dyn Fn(&Chef, &mut Arguments) -> anyhow::Result<()>;
type AsyncBody = dyn Fn(Chef, Arguments) -> LocalBoxFuture<'static, anyhow::Result<()>>;

enum Body {
    Sync(Box<SyncBody>),
    Async(Box<AsyncBody>),
}

/// A step callable together with its declared parameters.
///
/// Clones share the callable. Two actions are the same instance when they share both the
/// callable and the parameter list; binders use this identity to reuse cached plans.
#[derive(Clone)]
pub struct Action {
    body: Rc<Body>,
    parameters: Rc<Vec<Parameter>>,
}

impl Action {
    /// A step that runs to completion without suspending.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&Chef, &mut Arguments) -> anyhow::Result<()> + 'static,
    {
        Self {
            body: Rc::new(Body::Sync(Box::new(body))),
            parameters: Rc::default(),
        }
    }

    /// A step that may await, including suspending its coroutine.
    pub fn future<F, Fut>(body: F) -> Self
    where
        F: Fn(Chef, Arguments) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        Self {
            body: Rc::new(Body::Async(Box::new(move |chef, arguments| body(chef, arguments).boxed_local()))),
            parameters: Rc::default(),
        }
    }

    /// Declares one more parameter.
    pub fn parameter(mut self, parameter: Parameter) -> Self {
        Rc::make_mut(&mut self.parameters).push(parameter);
        self
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn same_instance(&self, other: &Action) -> bool {
        Rc::ptr_eq(&self.body, &other.body) && Rc::ptr_eq(&self.parameters, &other.parameters)
    }

    pub(crate) async fn invoke(&self, chef: &Chef, mut arguments: Arguments) -> anyhow::Result<()> {
        match &*self.body {
            Body::Sync(body) => body(chef, &mut arguments),
            Body::Async(body) => body(chef.clone(), arguments).await,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.body {
            Body::Sync(_) => "sync",
            Body::Async(_) => "async",
        };
        f.debug_struct("Action")
            .field("kind", &kind)
            .field("parameters", &self.parameters)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct DeclaredType {
    id: TypeId,
    name: &'static str,
}

impl DeclaredType {
    fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }
}

type TransformWith = Rc<dyn Fn(&Value) -> Option<Value>>;

#[derive(Clone)]
enum ParameterTransform {
    /// Use the transformable capability registered with the workplan entry.
    Capability,
    With(TransformWith),
}

/// Declared parameter of an [`Action`].
#[derive(Clone)]
pub struct Parameter {
    name: String,
    declared: Option<DeclaredType>,
    default: Option<Value>,
    transform: Option<ParameterTransform>,
}

impl Parameter {
    /// A parameter expecting a `T`.
    pub fn of<T: Any>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared: Some(DeclaredType::of::<T>()),
            default: None,
            transform: None,
        }
    }

    /// An untyped parameter. It can only bind by name or default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared: None,
            default: None,
            transform: None,
        }
    }

    pub fn or_default<T: Any + Clone>(mut self, value: T) -> Self {
        self.default = Some(Value::new(value));
        self
    }

    /// Converts the workplan entry with its registered [`Transformable`](crate::workplan::Transformable) capability.
    pub fn transformed(mut self) -> Self {
        self.transform = Some(ParameterTransform::Capability);
        self
    }

    /// Converts the workplan entry with `transform`.
    pub fn transformed_with<In, Out, F>(mut self, transform: F) -> Self
    where
        In: Any,
        Out: Any + Clone,
        F: Fn(&In) -> Out + 'static,
    {
        self.transform = Some(ParameterTransform::With(Rc::new(move |value: &Value| {
            value.downcast_ref::<In>().map(|input| Value::new(transform(input)))
        })));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is<T: Any>(&self) -> bool {
        self.declared.is_some_and(|declared| declared.id == TypeId::of::<T>())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("type", &self.declared.map(|declared| declared.name))
            .field("has_default", &self.default.is_some())
            .field("transformed", &self.transform.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum MappedTo {
    Key(String),
    Literal(Value),
}

/// Per-step parameter remapping.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    entries: IndexMap<String, MappedTo>,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `parameter` from the workplan entry `key` instead of its own name.
    pub fn rename(mut self, parameter: impl Into<String>, key: impl Into<String>) -> Self {
        self.entries.insert(parameter.into(), MappedTo::Key(key.into()));
        self
    }

    /// Binds `parameter` to `value`, bypassing the workplan.
    pub fn literal<T: Any + Clone>(mut self, parameter: impl Into<String>, value: T) -> Self {
        self.entries.insert(parameter.into(), MappedTo::Literal(Value::new(value)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolved arguments handed to a step.
#[derive(Debug, Default)]
pub struct Arguments {
    step: String,
    values: IndexMap<String, Value>,
}

impl Arguments {
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        let value = self.values.get(name).ok_or_else(|| self.unresolved(name))?;
        value.downcast_ref::<T>().ok_or_else(|| self.mismatch::<T>(name, value))
    }

    pub fn take<T: Any>(&mut self, name: &str) -> Result<T> {
        let value = self.values.shift_remove(name).ok_or_else(|| self.unresolved(name))?;
        match value.downcast::<T>() {
            Ok(resolved) => Ok(resolved),
            Err(value) => {
                let error = self.mismatch::<T>(name, &value);
                self.values.insert(name.to_string(), value);
                Err(error)
            }
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn unresolved(&self, name: &str) -> RecipeError {
        RecipeError::binding(&self.step, name, "was not resolved")
    }

    fn mismatch<T: Any>(&self, name: &str, value: &Value) -> RecipeError {
        RecipeError::binding(
            &self.step,
            name,
            format!("holds {}, not {}", value.type_name(), type_name::<T>()),
        )
    }
}

/// Handles available to rule 1 of the resolution order.
pub(crate) struct Scope<'a> {
    pub chef: &'a Chef,
    pub fiber: Option<Fiber>,
    pub supervisor: Option<Supervisor>,
}

enum Binding {
    Chef,
    Fiber,
    Supervisor,
    Literal(Value),
    Lookup {
        key: String,
        declared: Option<DeclaredType>,
        transform: Option<ParameterTransform>,
        default: Option<Value>,
    },
}

/// Parameter resolution compiled from an action's parameters and a mapping.
pub struct BindingPlan {
    bindings: Vec<(String, Binding)>,
}

impl BindingPlan {
    pub fn compile(parameters: &[Parameter], mapping: &Mapping) -> Self {
        let bindings = parameters
            .iter()
            .map(|parameter| (parameter.name.clone(), Self::compile_parameter(parameter, mapping)))
            .collect();
        Self { bindings }
    }

    fn compile_parameter(parameter: &Parameter, mapping: &Mapping) -> Binding {
        if parameter.is::<Chef>() {
            return Binding::Chef;
        }
        if parameter.is::<Fiber>() {
            return Binding::Fiber;
        }
        if parameter.is::<Supervisor>() {
            return Binding::Supervisor;
        }
        let key = match mapping.entries.get(&parameter.name) {
            Some(MappedTo::Literal(value)) => return Binding::Literal(value.clone()),
            Some(MappedTo::Key(key)) => key.clone(),
            None => parameter.name.clone(),
        };
        Binding::Lookup {
            key,
            declared: parameter.declared,
            transform: parameter.transform.clone(),
            default: parameter.default.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub(crate) fn resolve(&self, step: &str, scope: &Scope<'_>, workplan: &Workplan) -> Result<Arguments> {
        let mut values = IndexMap::with_capacity(self.bindings.len());
        for (parameter, binding) in &self.bindings {
            let value = match binding {
                Binding::Chef => Value::new(scope.chef.clone()),
                Binding::Fiber => match &scope.fiber {
                    Some(fiber) => Value::new(fiber.clone()),
                    None => return Err(RecipeError::binding(step, parameter, "needs a running coroutine")),
                },
                Binding::Supervisor => match &scope.supervisor {
                    Some(supervisor) => Value::new(supervisor.clone()),
                    None => return Err(RecipeError::binding(step, parameter, "needs an active supervisor")),
                },
                Binding::Literal(value) => value.clone(),
                Binding::Lookup {
                    key,
                    declared,
                    transform,
                    default,
                } => Self::lookup(step, parameter, key, *declared, transform.as_ref(), default.as_ref(), workplan)?,
            };
            values.insert(parameter.clone(), value);
        }
        Ok(Arguments {
            step: step.to_string(),
            values,
        })
    }

    fn lookup(
        step: &str,
        parameter: &str,
        key: &str,
        declared: Option<DeclaredType>,
        transform: Option<&ParameterTransform>,
        default: Option<&Value>,
        workplan: &Workplan,
    ) -> Result<Value> {
        if workplan.contains_key(key) {
            let value = match transform {
                None => workplan.value(key).cloned(),
                Some(ParameterTransform::Capability) => workplan.transformed(key),
                Some(ParameterTransform::With(transform)) => workplan.value(key).and_then(|value| transform(value)),
            };
            let Some(value) = value else {
                return Err(RecipeError::binding(
                    step,
                    parameter,
                    format!("could not be transformed from workplan entry '{key}'"),
                ));
            };
            if let Some(declared) = declared
                && value.type_id() != declared.id
            {
                return Err(RecipeError::binding(
                    step,
                    parameter,
                    format!("expects {}, found {} under '{key}'", declared.name, value.type_name()),
                ));
            }
            return Ok(value);
        }

        if let Some(declared) = declared
            && let Some((_, value)) = workplan.find_by_type(declared.id)
        {
            return Ok(value.clone());
        }

        default.cloned().ok_or_else(|| {
            let expected = declared.map_or("a value", |declared| declared.name);
            RecipeError::binding(step, parameter, format!("could not be resolved: no '{key}' entry and no {expected}"))
        })
    }
}

struct CachedPlan {
    action: Action,
    plan: Rc<BindingPlan>,
}

/// Mapping plus the binding plan cached for the last action it was used with.
pub(crate) struct Binder {
    mapping: Mapping,
    cache: RefCell<Option<CachedPlan>>,
}

impl Binder {
    pub fn new(mapping: Mapping) -> Self {
        Self {
            mapping,
            cache: RefCell::new(None),
        }
    }

    fn plan_for(&self, step: &str, action: &Action) -> Rc<BindingPlan> {
        let mut cache = self.cache.borrow_mut();
        if let Some(cached) = cache.as_ref()
            && cached.action.same_instance(action)
        {
            return cached.plan.clone();
        }
        let plan = Rc::new(BindingPlan::compile(action.parameters(), &self.mapping));
        debug!(step = %step, parameters = plan.len(), "compiled binding plan");
        *cache = Some(CachedPlan {
            action: action.clone(),
            plan: plan.clone(),
        });
        plan
    }

    pub fn bind(&self, step: &str, action: &Action, scope: &Scope<'_>, workplan: &RefCell<Workplan>) -> Result<Arguments> {
        let plan = self.plan_for(step, action);
        let workplan = workplan.try_borrow().map_err(|_| RecipeError::WorkplanBusy)?;
        plan.resolve(step, scope, &workplan)
    }
}

/// Plain step binder.
pub struct StepBowl {
    name: String,
    action: Action,
    binder: Binder,
}

impl StepBowl {
    pub fn new(name: impl Into<String>, action: Action, mapping: Mapping) -> Self {
        Self {
            name: name.into(),
            action,
            binder: Binder::new(mapping),
        }
    }
}

impl Bowl for StepBowl {
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
            let scope = Scope {
                chef,
                fiber: chef.fiber(),
                supervisor: supervisor.cloned(),
            };
            let arguments = self.binder.bind(&self.name, &self.action, &scope, workplan)?;
            self.action.invoke(chef, arguments).await.map_err(RecipeError::from_step)
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workplan::Transformable;

    #[derive(Debug, Clone, PartialEq)]
    struct Meters(f64);

    impl Transformable for Meters {
        type Output = f64;

        fn transform(&self) -> f64 {
            self.0 * 100.0
        }
    }

    fn resolve(parameters: Vec<Parameter>, mapping: Mapping, workplan: &Workplan) -> Result<Arguments> {
        let chef = Chef::new();
        let scope = Scope {
            chef: &chef,
            fiber: None,
            supervisor: None,
        };
        let mut action = Action::new(|_, _| Ok(()));
        for parameter in parameters {
            action = action.parameter(parameter);
        }
        BindingPlan::compile(action.parameters(), &mapping).resolve("probe", &scope, workplan)
    }

    #[test]
    fn chef_typed_parameters_bind_the_executor() {
        let arguments = resolve(vec![Parameter::of::<Chef>("cook")], Mapping::new(), &Workplan::new()).expect("bind");
        assert!(arguments.get::<Chef>("cook").is_ok());
    }

    #[test]
    fn named_lookup_wins_over_type_scan() {
        let workplan = Workplan::new().with("other", 1_i64).with("foo", 2_i64);
        let arguments = resolve(vec![Parameter::of::<i64>("foo")], Mapping::new(), &workplan).expect("bind");
        assert_eq!(arguments.get::<i64>("foo").ok(), Some(&2));
    }

    #[test]
    fn type_scan_picks_the_first_inserted_match() {
        let workplan = Workplan::new().with("first", 1_i64).with("second", 2_i64);
        let arguments = resolve(vec![Parameter::of::<i64>("count")], Mapping::new(), &workplan).expect("bind");
        assert_eq!(arguments.get::<i64>("count").ok(), Some(&1));
    }

    #[test]
    fn mapping_renames_the_lookup_key_and_binds_literals() {
        let workplan = Workplan::new().with("total", 9_i64);
        let mapping = Mapping::new().rename("n", "total").literal("label", "fixed".to_string());
        let arguments = resolve(
            vec![Parameter::of::<i64>("n"), Parameter::of::<String>("label")],
            mapping,
            &workplan,
        )
        .expect("bind");
        assert_eq!(arguments.get::<i64>("n").ok(), Some(&9));
        assert_eq!(arguments.get::<String>("label").map(String::as_str).ok(), Some("fixed"));
    }

    #[test]
    fn defaults_apply_only_when_nothing_else_resolves() {
        let parameters = || vec![Parameter::of::<u8>("retries").or_default(3_u8)];
        let empty = resolve(parameters(), Mapping::new(), &Workplan::new()).expect("bind");
        assert_eq!(empty.get::<u8>("retries").ok(), Some(&3));

        let stored = resolve(parameters(), Mapping::new(), &Workplan::new().with("retries", 5_u8)).expect("bind");
        assert_eq!(stored.get::<u8>("retries").ok(), Some(&5));
    }

    #[test]
    fn unresolvable_parameters_fail_with_a_binding_error() {
        let error = resolve(vec![Parameter::of::<i64>("n")], Mapping::new(), &Workplan::new()).expect_err("missing");
        let RecipeError::Binding { step, parameter, .. } = error else {
            panic!("expected a binding error, got {error:?}");
        };
        assert_eq!((step.as_str(), parameter.as_str()), ("probe", "n"));
    }

    #[test]
    fn named_entries_of_the_wrong_type_are_rejected() {
        let workplan = Workplan::new().with("n", "five".to_string());
        let error = resolve(vec![Parameter::of::<i64>("n")], Mapping::new(), &workplan).expect_err("mismatch");
        assert!(error.to_string().contains("found alloc::string::String"), "unexpected error: {error}");
    }

    #[test]
    fn transforms_run_before_binding() {
        let mut workplan = Workplan::new();
        workplan.insert_transformable("distance", Meters(2.5));
        workplan.insert("raw", Meters(1.0));

        let arguments = resolve(
            vec![
                Parameter::of::<f64>("distance").transformed(),
                Parameter::of::<String>("raw").transformed_with(|meters: &Meters| format!("{}m", meters.0)),
            ],
            Mapping::new(),
            &workplan,
        )
        .expect("bind");
        assert_eq!(arguments.get::<f64>("distance").ok(), Some(&250.0));
        assert_eq!(arguments.get::<String>("raw").map(String::as_str).ok(), Some("1m"));
    }

    #[test]
    fn coroutine_handles_need_a_coroutine_scope() {
        let error = resolve(vec![Parameter::of::<Fiber>("fiber")], Mapping::new(), &Workplan::new()).expect_err("no fiber");
        assert!(error.to_string().contains("running coroutine"));
    }

    #[test]
    fn arguments_report_missing_and_mistyped_parameters() {
        let mut arguments = resolve(vec![Parameter::named("n")], Mapping::new(), &Workplan::new().with("n", 4_i64)).expect("bind");
        assert!(matches!(arguments.get::<i64>("missing"), Err(RecipeError::Binding { .. })));
        assert!(arguments.take::<String>("n").is_err());
        assert_eq!(arguments.take::<i64>("n").ok(), Some(4));
        assert!(arguments.is_empty());
    }

    #[test]
    fn binder_reuses_plans_for_the_same_action_instance() {
        let binder = Binder::new(Mapping::new());
        let action = Action::new(|_, _| Ok(())).parameter(Parameter::named("x"));
        let first = binder.plan_for("step", &action);
        let second = binder.plan_for("step", &action.clone());
        assert!(Rc::ptr_eq(&first, &second));

        let other = Action::new(|_, _| Ok(())).parameter(Parameter::named("x"));
        let third = binder.plan_for("step", &other);
        assert!(!Rc::ptr_eq(&first, &third));
    }
}
