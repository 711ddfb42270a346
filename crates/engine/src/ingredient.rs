//! Input requirements checked before the first step runs.

use std::{
    any::{Any, type_name},
    rc::Rc,
};

use crate::{chef::Chef, error::Result, workplan::Workplan};

/// An input requirement.
///
/// Implementations either write the validated (or normalised) value into the workplan or
/// report the problem with [`Chef::missing`]; reported problems are collected and raised
/// together once every requirement has been checked.
pub trait Ingredient {
    fn name(&self) -> &str;

    fn prepare(&self, workplan: &mut Workplan, chef: &Chef) -> Result<()>;
}

type Normalizer<T> = Rc<dyn Fn(T) -> anyhow::Result<T>>;

/// Requires a workplan entry named `name` holding a `T`.
pub struct Require<T> {
    name: String,
    default: Option<T>,
    normalizer: Option<Normalizer<T>>,
}

impl<T: Any + Clone> Require<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            normalizer: None,
        }
    }

    /// Value stored when the entry is absent.
    pub fn or_default(mut self, value: T) -> Self {
        self.default = Some(value);
        self
    }

    /// Rewrites the entry before the first step runs. An error is reported as missing.
    pub fn normalize_with<F>(mut self, normalizer: F) -> Self
    where
        F: Fn(T) -> anyhow::Result<T> + 'static,
    {
        self.normalizer = Some(Rc::new(normalizer));
        self
    }
}

impl<T: Any + Clone> Ingredient for Require<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, workplan: &mut Workplan, chef: &Chef) -> Result<()> {
        let current = match workplan.value(&self.name) {
            None => match &self.default {
                Some(default) => default.clone(),
                None => {
                    chef.missing(&self.name, format!("required {} is missing", type_name::<T>()));
                    return Ok(());
                }
            },
            Some(value) => match value.downcast_ref::<T>() {
                Some(typed) => typed.clone(),
                None => {
                    chef.missing(&self.name, format!("expected {}, found {}", type_name::<T>(), value.type_name()));
                    return Ok(());
                }
            },
        };

        let prepared = match &self.normalizer {
            Some(normalize) => match normalize(current) {
                Ok(normalized) => normalized,
                Err(error) => {
                    chef.missing(&self.name, error.to_string());
                    return Ok(());
                }
            },
            None => current,
        };
        workplan.insert(self.name.clone(), prepared);
        Ok(())
    }
}
