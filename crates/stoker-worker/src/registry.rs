//! The worker operation table.
//!
//! Workers declare their operations by name up front; the mediator
//! (and its forked children) dispatch by string key against this
//! table. The same table backs the inline path, so an in-process call
//! and a forked call run the identical handler.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, WorkerError};

/// A worker operation: arguments in, value or error message out.
pub type Handler = Box<dyn Fn(&[Value]) -> std::result::Result<Value, String>>;

/// Operation name used when a registry is built from a bare function.
pub const DEFAULT_OP: &str = "run";

/// Names the mediator keeps for its own surface; operations cannot
/// shadow them.
const RESERVED: &[&str] = &[
    "call", "inline", "kill", "stats", "setup", "teardown", "shutdown", "retry",
];

/// A named set of operations plus an optional per-child setup hook.
#[derive(Default)]
pub struct WorkerRegistry {
    ops: HashMap<String, Handler>,
    setup: Option<Box<dyn Fn()>>,
}

impl WorkerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry exposing one bare function as [`DEFAULT_OP`].
    #[must_use]
    pub fn function(
        f: impl Fn(&[Value]) -> std::result::Result<Value, String> + 'static,
    ) -> Self {
        let mut registry = Self::new();
        registry.ops.insert(DEFAULT_OP.to_string(), Box::new(f));
        registry
    }

    /// Declares operation `name`.
    ///
    /// # Errors
    /// Invalid identifiers, collisions with the mediator surface, and
    /// duplicate registrations.
    pub fn operation(
        mut self,
        name: &str,
        f: impl Fn(&[Value]) -> std::result::Result<Value, String> + 'static,
    ) -> Result<Self> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(WorkerError::validation(format!(
                "operation name {name:?} is not an identifier"
            )));
        }
        if RESERVED.contains(&name) {
            return Err(WorkerError::validation(format!(
                "operation {name:?} collides with the mediator surface"
            )));
        }
        if self.ops.contains_key(name) {
            return Err(WorkerError::validation(format!(
                "operation {name:?} registered twice"
            )));
        }
        self.ops.insert(name.to_string(), Box::new(f));
        Ok(self)
    }

    /// Installs a hook every forked child runs once before its loop.
    #[must_use]
    pub fn with_setup(mut self, f: impl Fn() + 'static) -> Self {
        self.setup = Some(Box::new(f));
        self
    }

    /// Whether `method` is declared.
    #[must_use]
    pub fn contains(&self, method: &str) -> bool {
        self.ops.contains_key(method)
    }

    /// Declared operation names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of declared operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no operations are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Invokes `method` with `args`.
    ///
    /// The `Err` is the handler's own message (or an unknown-method
    /// note); how it is surfaced depends on the path — the child loop
    /// wraps it in the result sentinel, the inline path returns it
    /// directly.
    pub fn invoke(&self, method: &str, args: &[Value]) -> std::result::Result<Value, String> {
        match self.ops.get(method) {
            Some(handler) => handler(args),
            None => Err(format!("unknown operation {method:?}")),
        }
    }

    /// Runs the per-child setup hook, if any.
    pub fn run_setup(&self) {
        if let Some(setup) = &self.setup {
            setup();
        }
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("ops", &self.names())
            .field("has_setup", &self.setup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatch_by_name() {
        let registry = WorkerRegistry::new()
            .operation("echo", |args| {
                Ok(args.first().cloned().unwrap_or(Value::Null))
            })
            .unwrap()
            .operation("sum", |args| {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .unwrap();

        assert_eq!(registry.invoke("echo", &[json!("hi")]), Ok(json!("hi")));
        assert_eq!(registry.invoke("sum", &[json!(2), json!(3)]), Ok(json!(5)));
        assert!(registry.invoke("nope", &[]).is_err());
        assert_eq!(registry.names(), vec!["echo", "sum"]);
    }

    #[test]
    fn reserved_and_bad_names_rejected() {
        assert!(WorkerRegistry::new().operation("kill", |_| Ok(Value::Null)).is_err());
        assert!(WorkerRegistry::new().operation("stats", |_| Ok(Value::Null)).is_err());
        assert!(WorkerRegistry::new().operation("has space", |_| Ok(Value::Null)).is_err());
        assert!(WorkerRegistry::new().operation("", |_| Ok(Value::Null)).is_err());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = WorkerRegistry::new()
            .operation("once", |_| Ok(Value::Null))
            .unwrap();
        assert!(registry.operation("once", |_| Ok(Value::Null)).is_err());
    }

    #[test]
    fn bare_function_registry() {
        let registry = WorkerRegistry::function(|args| Ok(json!(args.len())));
        assert!(registry.contains(DEFAULT_OP));
        assert_eq!(registry.invoke(DEFAULT_OP, &[json!(1), json!(2)]), Ok(json!(2)));
    }

    #[test]
    fn handler_errors_come_back_verbatim() {
        let registry = WorkerRegistry::new()
            .operation("boom", |_| Err("kaput".to_string()))
            .unwrap();
        assert_eq!(registry.invoke("boom", &[]), Err("kaput".to_string()));
    }
}
