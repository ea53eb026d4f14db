//! Caller-managed invocation context for patched methods.
//!
//! Patch bodies sometimes need to know they are running as a patch - most
//! commonly to reach the shadow-renamed original. Instead of ambient global
//! state, the caller owns a small stack of frames and threads it through the
//! call chain that invokes patched methods.

use crate::compose::shadow_name;
use serde_json::Value;
use std::collections::BTreeMap;

/// One patched-method invocation: which method is running and any values the
/// caller wants visible to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextFrame {
    pub class: String,
    pub method: String,
    pub values: BTreeMap<String, Value>,
}

impl ContextFrame {
    /// The shadow name under which this method's original body is callable.
    pub fn shadow_target(&self) -> String {
        shadow_name(&self.class, &self.method)
    }
}

/// Explicit stack of invocation frames. Empty outside patched calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextStack {
    frames: Vec<ContextFrame>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame for an invocation of `class::method`.
    pub fn enter(&mut self, class: impl Into<String>, method: impl Into<String>) {
        self.frames.push(ContextFrame {
            class: class.into(),
            method: method.into(),
            values: BTreeMap::new(),
        });
    }

    pub fn exit(&mut self) -> Option<ContextFrame> {
        self.frames.pop()
    }

    pub fn current(&self) -> Option<&ContextFrame> {
        self.frames.last()
    }

    /// Topmost frame for `class::method`, if one is on the stack.
    pub fn frame(&self, class: &str, method: &str) -> Option<&ContextFrame> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.class == class && f.method == method)
    }

    /// A single value from the topmost matching frame.
    pub fn value(&self, class: &str, method: &str, key: &str) -> Option<&Value> {
        self.frame(class, method)?.values.get(key)
    }

    /// Set a value on the topmost matching frame. Returns false when no
    /// such invocation is on the stack.
    pub fn set(&mut self, class: &str, method: &str, key: impl Into<String>, value: Value) -> bool {
        match self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.class == class && f.method == method)
        {
            Some(frame) => {
                frame.values.insert(key.into(), value);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_outside_patched_calls() {
        let stack = ContextStack::new();
        assert!(stack.is_empty());
        assert!(stack.current().is_none());
        assert!(stack.value("A", "f", "k").is_none());
    }

    #[test]
    fn enter_set_get_exit() {
        let mut stack = ContextStack::new();
        stack.enter("Greeter", "hello");
        assert!(stack.set("Greeter", "hello", "lang", json!("en")));
        assert_eq!(stack.value("Greeter", "hello", "lang"), Some(&json!("en")));

        let frame = stack.exit().unwrap();
        assert_eq!(frame.method, "hello");
        assert!(stack.is_empty());
    }

    #[test]
    fn nested_invocations_shadow_outer_frames() {
        let mut stack = ContextStack::new();
        stack.enter("A", "f");
        stack.set("A", "f", "depth", json!(1));
        stack.enter("A", "f");
        stack.set("A", "f", "depth", json!(2));

        assert_eq!(stack.value("A", "f", "depth"), Some(&json!(2)));
        stack.exit();
        assert_eq!(stack.value("A", "f", "depth"), Some(&json!(1)));
    }

    #[test]
    fn set_without_matching_frame_is_refused() {
        let mut stack = ContextStack::new();
        stack.enter("A", "f");
        assert!(!stack.set("B", "g", "k", json!(0)));
    }

    #[test]
    fn frame_knows_its_shadow_target() {
        let mut stack = ContextStack::new();
        stack.enter("Greeter", "bye");
        assert_eq!(stack.current().unwrap().shadow_target(), "old_Greeter_bye_mp");
    }
}
