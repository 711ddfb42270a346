//! The workplan: mutable key/value state shared by the steps of one cooking cycle.
//!
//! Values are type-erased behind [`Value`] so a workplan can hold any clonable Rust type.
//! Keys are either explicit names or a type name (see [`Workplan::put`]), which lets a
//! step find "the most recently stored instance of `T`" without knowing its key.
//!
//! Cloning a workplan clones every value: sub-pipelines receive such a copy, so parent and
//! child diverge after the spawn.

use std::{
    any::{Any, TypeId, type_name},
    fmt,
};

use indexmap::IndexMap;

use crate::error::{RecipeError, Result};

/// Values that can absorb another value of the same type in place.
pub trait Mergeable: Sized {
    /// Merges `other` into `self` and returns `self`.
    fn merge(&mut self, other: Self) -> &mut Self;
}

/// Values that must be converted before being bound to a step parameter.
pub trait Transformable {
    type Output: Any + Clone;

    fn transform(&self) -> Self::Output;
}

trait Item: Any {
    fn clone_item(&self) -> Box<dyn Item>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    /// The `Option<T>` holding the value, so it can be moved out by type.
    fn slot_mut(&mut self) -> &mut dyn Any;
    fn item_type_name(&self) -> &'static str;
}

/// Storage for one wrapped value. It is only empty once the value has been moved out.
struct Held<T>(Option<T>);

impl<T: Any + Clone> Item for Held<T> {
    fn clone_item(&self) -> Box<dyn Item> {
        Box::new(Held(self.0.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        match &self.0 {
            Some(value) => value as &dyn Any,
            empty => empty as &dyn Any,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        match &mut self.0 {
            Some(value) => value as &mut dyn Any,
            empty => empty as &mut dyn Any,
        }
    }

    fn slot_mut(&mut self) -> &mut dyn Any {
        &mut self.0
    }

    fn item_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// A clonable, type-erased value.
pub struct Value {
    inner: Box<dyn Item>,
}

impl Value {
    /// Wraps `value`. Wrapping a `Value` returns a copy of it instead of nesting.
    pub fn new<T: Any + Clone>(value: T) -> Self {
        if let Some(already_wrapped) = (&value as &dyn Any).downcast_ref::<Value>() {
            return already_wrapped.clone();
        }
        Self {
            inner: Box::new(Held(Some(value))),
        }
    }

    /// Runtime type of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        Any::type_id(self.inner.as_any())
    }

    /// Name of the wrapped value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.inner.item_type_name()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id() == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.inner.as_any_mut().downcast_mut::<T>()
    }

    /// Unwraps the value, handing it back untouched when the type does not match.
    pub fn downcast<T: Any>(mut self) -> std::result::Result<T, Value> {
        let taken = self.inner.slot_mut().downcast_mut::<Option<T>>().and_then(Option::take);
        taken.ok_or(self)
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone_item(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value<{}>", self.type_name())
    }
}

type TransformFn = fn(&Value) -> Option<Value>;

fn transform_erased<T: Transformable + 'static>(value: &Value) -> Option<Value> {
    value.downcast_ref::<T>().map(|stored| Value::new(stored.transform()))
}

#[derive(Clone)]
struct Slot {
    value: Value,
    transform: Option<TransformFn>,
}

/// Insertion-ordered mapping from key to [`Value`].
#[derive(Clone, Default)]
pub struct Workplan {
    entries: IndexMap<String, Slot>,
}

impl Workplan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Workplan::insert`].
    pub fn with<T: Any + Clone>(mut self, key: impl Into<String>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder form of [`Workplan::put`].
    pub fn with_typed<T: Any + Clone>(mut self, value: T) -> Self {
        self.put(value);
        self
    }

    /// Stores `value` under `key`. An existing key keeps its position and loses its capabilities.
    pub fn insert<T: Any + Clone>(&mut self, key: impl Into<String>, value: T) {
        self.insert_slot(key.into(), Value::new(value), None);
    }

    /// Stores a value that exposes the transformable capability to the binder.
    pub fn insert_transformable<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Transformable + Any + Clone,
    {
        self.insert_slot(key.into(), Value::new(value), Some(transform_erased::<T>));
    }

    /// Stores `value` under its type name, replacing the previous instance of that type.
    pub fn put<T: Any + Clone>(&mut self, value: T) {
        self.insert(type_name::<T>(), value);
    }

    fn insert_slot(&mut self, key: String, value: Value, transform: Option<TransformFn>) {
        self.entries.insert(key, Slot { value, transform });
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|slot| slot.value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.entries.get_mut(key).and_then(|slot| slot.value.downcast_mut::<T>())
    }

    /// The most recent instance stored by [`Workplan::put`].
    pub fn get_typed<T: Any>(&self) -> Option<&T> {
        self.get::<T>(type_name::<T>())
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.shift_remove(key).map(|slot| slot.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges `updates` into this workplan. Existing keys are overwritten in place.
    pub fn extend(&mut self, updates: Workplan) {
        for (key, slot) in updates.entries {
            self.entries.insert(key, slot);
        }
    }

    /// First entry whose runtime type is `type_id`, in insertion order.
    pub fn find_by_type(&self, type_id: TypeId) -> Option<(&str, &Value)> {
        self.entries
            .iter()
            .find(|(_, slot)| slot.value.type_id() == type_id)
            .map(|(key, slot)| (key.as_str(), &slot.value))
    }

    /// Applies the transformable capability registered for `key`, when there is one.
    pub(crate) fn transformed(&self, key: &str) -> Option<Value> {
        let slot = self.entries.get(key)?;
        match slot.transform {
            Some(transform) => transform(&slot.value),
            None => Some(slot.value.clone()),
        }
    }

    /// Merges `value` into the entry stored under `key`.
    ///
    /// Never creates an entry: the key must exist and hold a `T`.
    pub fn merge<T>(&mut self, key: &str, value: T) -> Result<()>
    where
        T: Mergeable + Any + Clone,
    {
        let Some(slot) = self.entries.get_mut(key) else {
            return Err(RecipeError::merge(key, "no value is stored under this key"));
        };
        let found = slot.value.type_name();
        match slot.value.downcast_mut::<T>() {
            Some(stored) => {
                stored.merge(value);
                Ok(())
            }
            None => Err(RecipeError::merge(
                key,
                format!("stored {found} is not mergeable with {}", type_name::<T>()),
            )),
        }
    }
}

impl fmt::Debug for Workplan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(key, slot)| (key, slot.value.type_name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tally(Vec<u32>);

    impl Mergeable for Tally {
        fn merge(&mut self, other: Self) -> &mut Self {
            self.0.extend(other.0);
            self
        }
    }

    #[derive(Debug, Clone)]
    struct Celsius(f64);

    impl Transformable for Celsius {
        type Output = f64;

        fn transform(&self) -> f64 {
            self.0 * 9.0 / 5.0 + 32.0
        }
    }

    #[test]
    fn wrapping_a_value_does_not_nest() {
        let value = Value::new(Value::new(7_i64));
        assert!(value.is::<i64>());
        assert_eq!(value.downcast::<i64>().ok(), Some(7));
    }

    #[test]
    fn downcast_hands_back_mismatched_values() {
        let value = Value::new("text".to_string());
        let value = value.downcast::<i64>().expect_err("type mismatch");
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("text"));

        let copy = value.clone();
        assert_eq!(value.downcast::<String>().ok().as_deref(), Some("text"));
        assert_eq!(copy.type_name(), std::any::type_name::<String>());
        assert_eq!(copy.downcast::<String>().ok().as_deref(), Some("text"));
    }

    #[test]
    fn typed_entries_replace_previous_instances() {
        let mut workplan = Workplan::new();
        workplan.put(1_u8);
        workplan.put(2_u8);
        assert_eq!(workplan.len(), 1);
        assert_eq!(workplan.get_typed::<u8>(), Some(&2));
    }

    #[test]
    fn find_by_type_returns_first_inserted_match() {
        let workplan = Workplan::new().with("a", 1_i64).with("label", "x".to_string()).with("b", 2_i64);
        let (key, value) = workplan.find_by_type(TypeId::of::<i64>()).expect("match");
        assert_eq!(key, "a");
        assert_eq!(value.downcast_ref::<i64>(), Some(&1));
    }

    #[test]
    fn extend_overwrites_in_place_and_appends_new_keys() {
        let mut workplan = Workplan::new().with("a", 1_i64).with("b", 2_i64);
        workplan.extend(Workplan::new().with("a", 10_i64).with("c", 3_i64));
        assert_eq!(workplan.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(workplan.get::<i64>("a"), Some(&10));
    }

    #[test]
    fn merge_on_absent_key_fails() {
        let mut workplan = Workplan::new();
        let error = workplan.merge("tally", Tally(vec![1])).expect_err("absent key");
        assert!(matches!(error, RecipeError::Merge { .. }));
        assert!(workplan.is_empty());
    }

    #[test]
    fn merge_mutates_existing_entry_in_place() {
        let mut workplan = Workplan::new().with("tally", Tally(vec![1]));
        workplan.merge("tally", Tally(vec![2, 3])).expect("merge");
        assert_eq!(workplan.len(), 1);
        assert_eq!(workplan.get::<Tally>("tally"), Some(&Tally(vec![1, 2, 3])));
    }

    #[test]
    fn merge_rejects_values_of_another_type() {
        let mut workplan = Workplan::new().with("tally", 5_i64);
        let error = workplan.merge("tally", Tally(vec![1])).expect_err("not mergeable");
        assert!(error.to_string().contains("not mergeable"), "unexpected error: {error}");
    }

    #[test]
    fn transformable_entries_transform_on_request() {
        let mut workplan = Workplan::new();
        workplan.insert_transformable("temperature", Celsius(100.0));
        workplan.insert("plain", Celsius(0.0));

        let transformed = workplan.transformed("temperature").expect("entry");
        assert_eq!(transformed.downcast_ref::<f64>(), Some(&212.0));

        let untouched = workplan.transformed("plain").expect("entry");
        assert!(untouched.is::<Celsius>());
    }

    #[test]
    fn clones_are_independent() {
        let original = Workplan::new().with("n", 1_i64);
        let mut copy = original.clone();
        *copy.get_mut::<i64>("n").expect("n") = 2;
        assert_eq!(original.get::<i64>("n"), Some(&1));
    }
}
