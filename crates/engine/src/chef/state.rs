use std::{fmt, rc::Rc};

use crate::{
    error::RecipeError,
    recipe::{CompiledStep, Recipe},
    workplan::Value,
};

/// Lifecycle of a chef as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChefStatus {
    /// No recipe attached.
    Free,
    /// A compiled recipe is attached and waiting for `process`.
    Trained,
    /// A cooking cycle is running.
    Cooking,
}

impl fmt::Display for ChefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChefStatus::Free => "free",
            ChefStatus::Trained => "trained",
            ChefStatus::Cooking => "cooking",
        };
        f.write_str(label)
    }
}

pub(crate) enum ChefState {
    Free,
    Trained { recipe: Recipe },
    Cooking(Box<Cooking>),
}

impl ChefState {
    pub(crate) fn status(&self) -> ChefStatus {
        match self {
            ChefState::Free => ChefStatus::Free,
            ChefState::Trained { .. } => ChefStatus::Trained,
            ChefState::Cooking(_) => ChefStatus::Cooking,
        }
    }
}

/// Dispatch bookkeeping for one cooking cycle.
pub(crate) struct Cooking {
    pub recipe: Recipe,
    pub steps: Rc<[CompiledStep]>,
    pub current: Option<usize>,
    pub jump: Option<usize>,
    pub interrupted: bool,
    pub finished: bool,
    pub result: Option<Value>,
    pub error_reporting: bool,
    pub pending_error: Option<RecipeError>,
}

impl Cooking {
    pub(crate) fn new(recipe: Recipe, steps: Rc<[CompiledStep]>) -> Self {
        Self {
            recipe,
            steps,
            current: None,
            jump: None,
            interrupted: false,
            finished: false,
            result: None,
            error_reporting: true,
            pending_error: None,
        }
    }

    pub(crate) fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name == name)
    }

    /// Moves to the next step: the recorded jump target, otherwise the following step.
    pub(crate) fn advance(&mut self) -> Option<usize> {
        if self.finished || self.interrupted {
            return None;
        }
        let next = match self.jump.take() {
            Some(index) => Some(index),
            None => match self.current {
                None => (!self.steps.is_empty()).then_some(0),
                Some(index) => (index + 1 < self.steps.len()).then_some(index + 1),
            },
        };
        if next.is_some() {
            self.current = next;
        }
        next
    }
}
