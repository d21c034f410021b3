//! Handlers for custom host messages.

use std::{collections::HashMap, fmt};

use serde_json::Value;

/// Handler invoked with the payload of a `cmd:<name>` message.
pub type CommandHandler = Box<dyn FnMut(Value) + Send>;

/// Mapping from custom command name to its handler.
///
/// Built before the session starts. Each matching host message invokes its
/// handler exactly once, in arrival order; unknown names are dropped.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any handler with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_command<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(Value) + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Invoke the handler for `name`. Returns false when none is registered.
    pub fn dispatch(&mut self, name: &str, data: Value) -> bool {
        match self.handlers.get_mut(name) {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}
