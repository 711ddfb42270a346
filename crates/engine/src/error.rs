//! Error types for pipeline definition, binding and execution.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T, E = RecipeError> = std::result::Result<T, E>;

/// A single unmet input requirement reported through [`Chef::missing`](crate::Chef::missing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingIngredient {
    /// Name of the ingredient that reported the problem.
    pub ingredient: String,
    /// Human readable description of what is missing or invalid.
    pub message: String,
}

impl fmt::Display for MissingIngredient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.ingredient, self.message)
    }
}

/// Main error type for the engine.
///
/// The type is `Clone` because the error surfaced to error handlers is stored in the workplan
/// under [`ERROR_KEY`](crate::ERROR_KEY) while the same error may still be re-raised to the caller.
#[derive(Debug, Clone, Error)]
pub enum RecipeError {
    #[error("binding error in step '{step}': parameter '{parameter}' {reason}")]
    Binding { step: String, parameter: String, reason: String },

    #[error("missing ingredients: {}", join_missing(.0))]
    MissingIngredients(Vec<MissingIngredient>),

    #[error("cannot merge into '{key}': {reason}")]
    Merge { key: String, reason: String },

    /// Failure raised by a step's own logic. Displays the step's message unchanged.
    #[error("{0}")]
    Step(Arc<anyhow::Error>),

    #[error("supervisor misuse: {reason}")]
    SupervisorMisuse { reason: String },

    #[error("supervisor stalled: {pending} item(s) cannot make progress")]
    SupervisorStalled { pending: usize },

    #[error("coroutine '{label}' cannot {operation}: {reason}")]
    Fiber { label: String, operation: String, reason: String },

    #[error("a step suspended while no coroutine was running")]
    SuspendedOutsideFiber,

    #[error("chef cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    #[error("no step named '{name}' in the compiled recipe")]
    UnknownStep { name: String },

    #[error("workplan is already borrowed")]
    WorkplanBusy,

    #[error("dispatch limit of {limit} steps exceeded")]
    DispatchLimit { limit: u64 },

    #[error("unexpected dish: expected {expected}, got {found}")]
    UnexpectedDish { expected: String, found: String },
}

impl RecipeError {
    /// Create a binding error.
    pub fn binding(step: impl Into<String>, parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Binding {
            step: step.into(),
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Create a merge error.
    pub fn merge(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Merge {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a supervisor misuse error.
    pub fn supervisor_misuse(reason: impl Into<String>) -> Self {
        Self::SupervisorMisuse { reason: reason.into() }
    }

    /// Create a coroutine lifecycle error.
    pub fn fiber(label: impl Into<String>, operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fiber {
            label: label.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(operation: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.into(),
        }
    }

    /// Create an unknown step error.
    pub fn unknown_step(name: impl Into<String>) -> Self {
        Self::UnknownStep { name: name.into() }
    }

    /// Wraps a step failure. Errors that already carry a `RecipeError` are unwrapped.
    pub fn from_step(error: anyhow::Error) -> Self {
        match error.downcast::<RecipeError>() {
            Ok(recipe_error) => recipe_error,
            Err(other) => Self::Step(Arc::new(other)),
        }
    }

    /// Returns the step failure if this error was raised by a step's own logic.
    pub fn step_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Step(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RecipeError {
    fn from(error: anyhow::Error) -> Self {
        Self::from_step(error)
    }
}

fn join_missing(missing: &[MissingIngredient]) -> String {
    missing.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
