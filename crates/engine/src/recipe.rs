//! Immutable recipe builder.
//!
//! Every builder method returns a new [`Recipe`] and leaves the receiver untouched, so one
//! template can be extended in different directions and train any number of chefs.

use std::{fmt, rc::Rc};

use once_cell::unsync::OnceCell;
use tracing::debug;

use crate::{
    bowl::{Action, Bowl, FiberBowl, Mapping, RecipeBowl, Repeat, StepBowl},
    chef::Chef,
    dish::Dish,
    error::Result,
    ingredient::Ingredient,
    workplan::{Value, Workplan},
};

#[derive(Clone)]
struct RecipeStep {
    position: i32,
    sequence: usize,
    bowl: Rc<dyn Bowl>,
}

/// A step in dispatch order.
#[derive(Clone)]
pub struct CompiledStep {
    pub name: String,
    pub bowl: Rc<dyn Bowl>,
}

impl fmt::Debug for CompiledStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledStep").field("name", &self.name).finish()
    }
}

/// Ordered steps plus the required inputs, error handlers and expected output of a pipeline.
#[derive(Clone, Default)]
pub struct Recipe {
    requirements: Vec<Rc<dyn Ingredient>>,
    steps: Vec<RecipeStep>,
    handlers: Vec<Rc<dyn Bowl>>,
    dish: Option<Rc<dyn Dish>>,
    compiled: OnceCell<Rc<[CompiledStep]>>,
}

impl Recipe {
    pub fn new() -> Self {
        Self::default()
    }

    fn draft(&self) -> Self {
        Self {
            requirements: self.requirements.clone(),
            steps: self.steps.clone(),
            handlers: self.handlers.clone(),
            dish: self.dish.clone(),
            compiled: OnceCell::new(),
        }
    }

    /// Adds an input requirement. All requirements are checked before the first step runs.
    pub fn require(&self, ingredient: impl Ingredient + 'static) -> Self {
        let mut next = self.draft();
        next.requirements.push(Rc::new(ingredient));
        next
    }

    /// Appends a step after the current last position.
    pub fn cook(&self, name: &str, action: Action) -> Self {
        self.cook_bowl(StepBowl::new(name, action, Mapping::new()), None)
    }

    pub fn cook_mapped(&self, name: &str, action: Action, mapping: Mapping) -> Self {
        self.cook_bowl(StepBowl::new(name, action, mapping), None)
    }

    /// Adds a step at `position`. Steps sharing a position keep their insertion order.
    pub fn cook_at(&self, position: i32, name: &str, action: Action, mapping: Mapping) -> Self {
        self.cook_bowl(StepBowl::new(name, action, mapping), Some(position))
    }

    /// Appends a step that runs as a coroutine under the active supervisor.
    pub fn cook_in_fiber(&self, name: &str, action: Action, mapping: Mapping) -> Self {
        self.cook_bowl(FiberBowl::new(name, action, mapping), None)
    }

    /// Adds any binder as a step; `None` appends it after the current last position.
    pub fn cook_bowl(&self, bowl: impl Bowl + 'static, position: Option<i32>) -> Self {
        let mut next = self.draft();
        let position = position.unwrap_or_else(|| next.next_position());
        let sequence = next.steps.len();
        next.steps.push(RecipeStep {
            position,
            sequence,
            bowl: Rc::new(bowl),
        });
        next
    }

    /// Appends a sub-recipe step.
    pub fn execute(&self, name: &str, sub_recipe: &Recipe, repeat: impl Into<Repeat>) -> Self {
        self.execute_with(name, sub_recipe, repeat, None, false)
    }

    pub fn execute_with(
        &self,
        name: &str,
        sub_recipe: &Recipe,
        repeat: impl Into<Repeat>,
        position: Option<i32>,
        in_fiber: bool,
    ) -> Self {
        let bowl = RecipeBowl::new(name, sub_recipe.clone(), repeat).in_fiber(in_fiber);
        self.cook_bowl(bowl, position)
    }

    /// Adds an error handler. Handlers run in registration order.
    pub fn on_error(&self, action: Action) -> Self {
        let mut next = self.draft();
        let name = format!("on_error#{}", next.handlers.len() + 1);
        next.handlers.push(Rc::new(StepBowl::new(name, action, Mapping::new())));
        next
    }

    /// Sets the expected output validator, replacing any previous one.
    pub fn given(&self, dish: impl Dish + 'static) -> Self {
        let mut next = self.draft();
        next.dish = Some(Rc::new(dish));
        next
    }

    /// Trains `chef` with a compiled copy of this recipe and returns that copy.
    pub fn train(&self, chef: &Chef) -> Result<Recipe> {
        let trained = self.draft();
        let steps = trained.compiled_steps();
        debug!(steps = steps.len(), requirements = trained.requirements.len(), "recipe compiled");
        chef.attach(trained.clone())?;
        Ok(trained)
    }

    /// Runs every input requirement against `workplan`.
    pub fn prepare(&self, workplan: &mut Workplan, chef: &Chef) -> Result<()> {
        for ingredient in &self.requirements {
            ingredient.prepare(workplan, chef)?;
        }
        Ok(())
    }

    /// Checks `value` against the expected output, if one is set.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match &self.dish {
            Some(dish) => dish.is_excepted(value),
            None => Ok(()),
        }
    }

    /// Step names in dispatch order.
    pub fn step_names(&self) -> Vec<String> {
        self.compiled_steps().iter().map(|step| step.name.clone()).collect()
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.get().is_some()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn compiled_steps(&self) -> Rc<[CompiledStep]> {
        self.compiled
            .get_or_init(|| {
                let mut ordered: Vec<&RecipeStep> = self.steps.iter().collect();
                ordered.sort_by_key(|step| (step.position, step.sequence));
                ordered
                    .into_iter()
                    .map(|step| CompiledStep {
                        name: step.bowl.name().to_string(),
                        bowl: step.bowl.clone(),
                    })
                    .collect()
            })
            .clone()
    }

    pub(crate) fn handlers(&self) -> &[Rc<dyn Bowl>] {
        &self.handlers
    }

    fn next_position(&self) -> i32 {
        self.steps.iter().map(|step| step.position).max().map_or(0, |max| max.saturating_add(1))
    }
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("requirements", &self.requirements.iter().map(|ingredient| ingredient.name()).collect::<Vec<_>>())
            .field("steps", &self.steps.iter().map(|step| step.bowl.name()).collect::<Vec<_>>())
            .field("handlers", &self.handlers.len())
            .field("has_dish", &self.dish.is_some())
            .field("compiled", &self.is_compiled())
            .finish()
    }
}
