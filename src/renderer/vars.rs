//! Lexically scoped template variables.

use std::sync::Arc;

use serde_json::{Map, Value};

#[derive(Debug)]
struct Frame {
    vars: Map<String, Value>,
    parent: VarStack,
}

/// Persistent stack of variable frames, innermost first.
///
/// Pushing returns a new stack that shares every outer frame with the old
/// one, so a module call pushes its arguments without copying or mutating
/// the caller's scope, and the caller's stack is untouched when it returns.
#[derive(Debug, Clone, Default)]
pub struct VarStack {
    top: Option<Arc<Frame>>,
}

impl VarStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stack with `vars` as its only frame.
    pub fn with_frame(vars: Map<String, Value>) -> Self {
        Self::new().push(vars)
    }

    /// A new stack with `vars` as the innermost frame.
    #[must_use]
    pub fn push(&self, vars: Map<String, Value>) -> Self {
        Self {
            top: Some(Arc::new(Frame {
                vars,
                parent: self.clone(),
            })),
        }
    }

    /// A new stack with `vars` as the outermost frame.
    ///
    /// Globals are pushed this way so that frames supplied by the caller
    /// still shadow them.
    #[must_use]
    pub fn push_outermost(&self, vars: Map<String, Value>) -> Self {
        let mut frames: Vec<&Map<String, Value>> = self.frames().collect();
        let mut stack = VarStack::with_frame(vars);
        while let Some(frame) = frames.pop() {
            stack = stack.push(frame.clone());
        }
        stack
    }

    /// Frames from innermost to outermost.
    pub fn frames(&self) -> Frames<'_> {
        Frames {
            next: self.top.as_deref(),
        }
    }

    /// First non-null value bound to `name`, searching innermost first.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames().find_map(|vars| vars.get(name).filter(|v| !v.is_null()))
    }

    pub fn depth(&self) -> usize {
        self.frames().count()
    }

    pub fn is_empty(&self) -> bool {
        self.top.is_none()
    }
}

/// Iterator over the frames of a [`VarStack`].
pub struct Frames<'a> {
    next: Option<&'a Frame>,
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a Map<String, Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.next?;
        self.next = frame.parent.top.as_deref();
        Some(&frame.vars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_inner_frames_shadow_outer() {
        let globals = VarStack::with_frame(frame(json!({"type": "foo", "env": "prod"})));
        let inner = globals.push(frame(json!({"type": "foobar"})));

        assert_eq!(inner.lookup("type"), Some(&json!("foobar")));
        assert_eq!(inner.lookup("env"), Some(&json!("prod")));
        assert_eq!(globals.lookup("type"), Some(&json!("foo")));
        assert_eq!(inner.depth(), 2);
        assert!(inner.lookup("missing").is_none());
    }

    #[test]
    fn test_null_does_not_shadow() {
        let stack = VarStack::with_frame(frame(json!({"a": 1}))).push(frame(json!({"a": null})));
        assert_eq!(stack.lookup("a"), Some(&json!(1)));
    }

    #[test]
    fn test_push_outermost_keeps_caller_frames_inside() {
        let caller = VarStack::with_frame(frame(json!({"type": "caller"})));
        let globals = frame(json!({"type": "global", "only": "global"}));
        let stack = caller.push_outermost(globals.clone());
        assert_eq!(stack.lookup("type"), Some(&json!("caller")));
        assert_eq!(stack.lookup("only"), Some(&json!("global")));
        assert_eq!(stack.frames().last(), Some(&globals));
    }
}
