//! Expected-output validation and result continuations.

use std::{
    any::{Any, type_name},
    cell::RefCell,
    rc::Rc,
};

use tracing::debug;

use crate::{
    error::{RecipeError, Result},
    workplan::Value,
};

/// Validator for the value a cycle finishes with.
pub trait Dish {
    /// Accepts or rejects `value`. A rejection is returned from [`Chef::finish`](crate::Chef::finish).
    fn is_excepted(&self, value: &Value) -> Result<()>;
}

/// Continuation receiving a pipeline's final result.
pub trait Promise<T> {
    fn success(&self, result: T) -> anyhow::Result<()>;

    fn fail(&self, error: &RecipeError);
}

/// Accepts values of type `T` and reports them to an optional promise.
pub struct DishClass<T> {
    promise: Option<Rc<dyn Promise<T>>>,
}

impl<T: Any + Clone> DishClass<T> {
    pub fn new() -> Self {
        Self { promise: None }
    }

    pub fn with_promise(promise: Rc<dyn Promise<T>>) -> Self {
        Self { promise: Some(promise) }
    }
}

impl<T: Any + Clone> Default for DishClass<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Any + Clone> Dish for DishClass<T> {
    fn is_excepted(&self, value: &Value) -> Result<()> {
        let Some(accepted) = value.downcast_ref::<T>() else {
            let error = RecipeError::UnexpectedDish {
                expected: type_name::<T>().to_string(),
                found: value.type_name().to_string(),
            };
            if let Some(promise) = &self.promise {
                promise.fail(&error);
            }
            return Err(error);
        };
        match &self.promise {
            Some(promise) => promise.success(accepted.clone()).map_err(RecipeError::from_step),
            None => Ok(()),
        }
    }
}

type SuccessCallback<T> = Box<dyn Fn(T) -> anyhow::Result<T>>;
type FailCallback = Box<dyn Fn(&RecipeError)>;

struct Next<T> {
    promise: Rc<dyn Promise<T>>,
    auto_call: bool,
}

/// Promise built from closures, optionally chained to a further promise.
///
/// `on_success` may rewrite the result before it is stored. With `auto_call` the chained
/// promise receives the stored result right away; otherwise [`CallbackPromise::call_next`]
/// forwards it on demand.
pub struct CallbackPromise<T> {
    on_success: SuccessCallback<T>,
    on_fail: Option<FailCallback>,
    next: Option<Next<T>>,
    result: RefCell<Option<T>>,
    error: RefCell<Option<RecipeError>>,
}

impl<T: Clone + 'static> CallbackPromise<T> {
    pub fn new<F>(on_success: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<T> + 'static,
    {
        Self {
            on_success: Box::new(on_success),
            on_fail: None,
            next: None,
            result: RefCell::new(None),
            error: RefCell::new(None),
        }
    }

    /// Promise that stores the result unchanged.
    pub fn collecting() -> Self {
        Self::new(Ok)
    }

    pub fn on_fail<F>(mut self, on_fail: F) -> Self
    where
        F: Fn(&RecipeError) + 'static,
    {
        self.on_fail = Some(Box::new(on_fail));
        self
    }

    pub fn next(mut self, promise: Rc<dyn Promise<T>>, auto_call: bool) -> Self {
        self.next = Some(Next { promise, auto_call });
        self
    }

    pub fn result(&self) -> Option<T> {
        self.result.borrow().clone()
    }

    pub fn error(&self) -> Option<RecipeError> {
        self.error.borrow().clone()
    }

    /// Forwards the stored result (or failure) to the chained promise.
    pub fn call_next(&self) -> anyhow::Result<()> {
        let Some(next) = &self.next else {
            return Ok(());
        };
        if let Some(error) = self.error() {
            next.promise.fail(&error);
            return Ok(());
        }
        match self.result() {
            Some(result) => next.promise.success(result),
            None => Ok(()),
        }
    }

    fn auto_calls(&self) -> bool {
        self.next.as_ref().is_some_and(|next| next.auto_call)
    }
}

impl<T: Clone + 'static> Promise<T> for CallbackPromise<T> {
    fn success(&self, result: T) -> anyhow::Result<()> {
        let result = (self.on_success)(result)?;
        *self.result.borrow_mut() = Some(result);
        if self.auto_calls() {
            debug!(result = type_name::<T>(), "forwarding result to chained promise");
            self.call_next()?;
        }
        Ok(())
    }

    fn fail(&self, error: &RecipeError) {
        *self.error.borrow_mut() = Some(error.clone());
        if let Some(on_fail) = &self.on_fail {
            on_fail(error);
        }
        if self.auto_calls()
            && let Some(next) = &self.next
        {
            next.promise.fail(error);
        }
    }
}
