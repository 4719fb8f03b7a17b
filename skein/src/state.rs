//! Typed shared state for workflow runs.
//!
//! The state is a string-keyed value map plus the conversation message list
//! used by prompt steps. Typed access goes through [`TypedKey`], which pairs
//! a key name with a phantom type so reads fail with `KeyTypeMismatch`
//! instead of silently mis-decoding between steps.
//!
//! Ownership: the workflow that started the run owns the state until the
//! run terminates. Within a step, mutation is free-form and single-threaded.
//! Across a `Parallel` boundary each branch receives a [`fork`](SharedState::fork)
//! and the combinator's aggregator merges branch copies back into the parent.

use std::collections::HashMap;
use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, StateError};
use crate::message::Message;

/// A state key carrying its value type.
///
/// ```rust,ignore
/// const DRAFT: TypedKey<Draft> = TypedKey::new("draft");
/// state.set(&DRAFT, draft)?;
/// let draft: Draft = state.get(&DRAFT)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TypedKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    /// Create a key with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The key name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// The shared key/value state and conversation of a workflow run.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    values: HashMap<String, Value>,
    messages: Vec<Message>,
}

impl SharedState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state seeded with one message.
    #[must_use]
    pub fn with_message(message: Message) -> Self {
        Self {
            values: HashMap::new(),
            messages: vec![message],
        }
    }

    /// Store a value under a typed key.
    pub fn set<T: Serialize>(&mut self, key: &TypedKey<T>, value: T) {
        // Serialize can only fail for non-tree shapes (e.g. map keys that
        // are not strings); treat those as programmer error via Null.
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.values.insert(key.name.to_owned(), value);
    }

    /// Retrieve a typed value.
    ///
    /// # Errors
    ///
    /// `KeyMissing` when nothing is stored under the key, `KeyTypeMismatch`
    /// when the stored value does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &TypedKey<T>) -> Result<T> {
        let value = self.values.get(key.name).ok_or_else(|| StateError::KeyMissing {
            key: key.name.to_owned(),
        })?;
        serde_json::from_value(value.clone()).map_err(|_| {
            StateError::KeyTypeMismatch {
                key: key.name.to_owned(),
                expected: std::any::type_name::<T>(),
            }
            .into()
        })
    }

    /// Store a raw value under a string key.
    pub fn set_raw(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Retrieve a raw value.
    #[must_use]
    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Remove a key, returning the previous value if any.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The conversation messages.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a message to the conversation.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace the conversation.
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Shallow copy for a parallel branch.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Merge a branch copy into this state with a shallow overwrite.
    ///
    /// Later calls win on key collisions, which gives declaration-order
    /// tie-breaks when the parallel combinator merges branches in order.
    /// Branch messages appended beyond the parent's prefix are carried over.
    pub fn merge_overwrite(&mut self, branch: Self) {
        for (key, value) in branch.values {
            self.values.insert(key, value);
        }
        if branch.messages.len() > self.messages.len() {
            self.messages
                .extend(branch.messages.into_iter().skip(self.messages.len()));
        }
    }

    /// The value map as a JSON object, for `StateSnapshot` events.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Draft {
        title: String,
    }

    const DRAFT: TypedKey<Draft> = TypedKey::new("draft");
    const COUNT: TypedKey<u64> = TypedKey::new("count");

    #[test]
    fn typed_round_trip() {
        let mut state = SharedState::new();
        state.set(
            &DRAFT,
            Draft {
                title: "hello".into(),
            },
        );
        assert_eq!(state.get(&DRAFT).unwrap().title, "hello");
    }

    #[test]
    fn missing_key() {
        let state = SharedState::new();
        match state.get(&COUNT) {
            Err(Error::State(StateError::KeyMissing { key })) => assert_eq!(key, "count"),
            other => panic!("expected KeyMissing, got {other:?}"),
        }
    }

    #[test]
    fn type_mismatch() {
        let mut state = SharedState::new();
        state.set_raw("count", json!("not a number"));
        match state.get(&COUNT) {
            Err(Error::State(StateError::KeyTypeMismatch { key, .. })) => {
                assert_eq!(key, "count");
            }
            other => panic!("expected KeyTypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn fork_isolates_branches() {
        let mut parent = SharedState::new();
        parent.set_raw("shared", json!(1));

        let mut branch = parent.fork();
        branch.set_raw("shared", json!(2));
        branch.set_raw("own", json!(true));

        assert_eq!(parent.get_raw("shared"), Some(&json!(1)));
        parent.merge_overwrite(branch);
        assert_eq!(parent.get_raw("shared"), Some(&json!(2)));
        assert_eq!(parent.get_raw("own"), Some(&json!(true)));
    }

    #[test]
    fn merge_carries_new_branch_messages() {
        let mut parent = SharedState::with_message(Message::user("hi"));
        let mut branch = parent.fork();
        branch.push_message(Message::assistant("branch says"));

        parent.merge_overwrite(branch);
        assert_eq!(parent.messages().len(), 2);
    }
}
