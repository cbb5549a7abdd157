//! Static command registry.
//!
//! Commands are the fixed half of the search corpus: navigation and action
//! entries defined by the embedding application at startup. The engine only
//! ranks them; `action_id` is an opaque reference the UI layer resolves
//! through its own dispatch table.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StaticCommand {
    pub id: String,
    /// Display text, also the primary match field.
    pub text: String,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Extra match terms beyond the display text.
    pub keywords: Vec<String>,
    /// Higher sorts earlier on an empty query.
    pub priority: i32,
    pub action_id: String,
}

/// Commands registered at startup, in registration order.
pub struct CommandRegistry {
    commands: Vec<StaticCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    /// Register a command. A command with an existing id replaces the old
    /// one.
    pub fn register(&mut self, command: StaticCommand) {
        if let Some(existing) = self.commands.iter_mut().find(|c| c.id == command.id) {
            *existing = command;
        } else {
            self.commands.push(command);
        }
    }

    pub fn all(&self) -> &[StaticCommand] {
        &self.commands
    }

    pub fn find(&self, id: &str) -> Option<&StaticCommand> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: &str, priority: i32) -> StaticCommand {
        StaticCommand {
            id: id.to_string(),
            text: format!("Go to {}", id),
            category: "navigation".to_string(),
            icon: None,
            keywords: vec![],
            priority,
            action_id: format!("nav:{}", id),
        }
    }

    #[test]
    fn register_and_find() {
        let mut registry = CommandRegistry::new();
        registry.register(command("home", 4));
        registry.register(command("inbox", 3));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("inbox").unwrap().priority, 3);
        assert!(registry.find("nope").is_none());
    }

    #[test]
    fn reregistering_replaces_by_id() {
        let mut registry = CommandRegistry::new();
        registry.register(command("home", 4));
        registry.register(command("home", 9));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find("home").unwrap().priority, 9);
    }
}
