//! # Brigade Engine
//!
//! An in-process step-pipeline runtime. A [`Recipe`] lists required inputs, ordered steps,
//! error handlers and the expected output; a [`Chef`] trained with it runs the steps against
//! a shared [`Workplan`], resolving every step's parameters from that workplan.
//!
//! ## Key Features
//!
//! - **Argument binding**: parameters bind the chef, a mapped literal, a named entry, the
//!   first entry of the declared type, or the parameter default, in that order
//! - **Dispatch control**: steps update the workplan, jump to named steps, raise into an
//!   ordered error-handler chain, interrupt or finish the cycle
//! - **Sub-recipes**: nested recipes run in child chefs on a copy of the workplan, once, a
//!   fixed number of times, or until a controller stops the loop
//! - **Coroutines**: steps can run as suspendable [`Fiber`]s driven round-robin by a
//!   [`Supervisor`] tree
//!
//! ## Usage
//!
//! ```rust
//! use brigade_engine::{Action, Chef, Parameter, Recipe, Require, Workplan};
//!
//! let increment = Action::new(|chef, arguments| {
//!     let n = *arguments.get::<i64>("n")?;
//!     chef.continue_with(Workplan::new().with("n", n + 1), None)?;
//!     Ok(())
//! })
//! .parameter(Parameter::of::<i64>("n"));
//! let serve = Action::new(|chef, arguments| {
//!     chef.finish(*arguments.get::<i64>("n")?)?;
//!     Ok(())
//! })
//! .parameter(Parameter::of::<i64>("n"));
//!
//! let recipe = Recipe::new()
//!     .require(Require::<i64>::new("n"))
//!     .cook("increment", increment)
//!     .cook("serve", serve);
//!
//! let chef = Chef::new();
//! chef.read(&recipe)?;
//! let dish = chef.process(Workplan::new().with("n", 5_i64))?;
//! assert_eq!(dish.and_then(|value| value.downcast::<i64>().ok()), Some(6));
//! # Ok::<(), brigade_engine::RecipeError>(())
//! ```

pub mod bowl;
pub mod chef;
pub mod dish;
pub mod error;
pub mod fiber;
pub mod ingredient;
pub mod recipe;
pub mod settings;
pub mod supervisor;
pub mod workplan;

pub use bowl::{Action, Arguments, BindingPlan, Bowl, DynamicBowl, FiberBowl, LoopControl, Mapping, Parameter, RecipeBowl, Repeat, StepBowl};
pub use chef::{Chef, ChefStatus};
pub use dish::{CallbackPromise, Dish, DishClass, Promise};
pub use error::{MissingIngredient, RecipeError, Result};
pub use fiber::{Fiber, FiberStatus, Suspend};
pub use ingredient::{Ingredient, Require};
pub use recipe::{CompiledStep, Recipe};
pub use settings::{ChefSettings, SettingsError, load_settings, load_settings_from};
pub use supervisor::Supervisor;
pub use workplan::{Mergeable, Transformable, Value, Workplan};

/// Workplan key under which error handlers find the error being handled.
pub const ERROR_KEY: &str = "exception";
