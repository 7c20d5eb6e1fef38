pub mod word_counter;

use std::sync::Arc;

use crate::registry::ToolRegistry;

pub use word_counter::WordCounterTool;

/// Create a ToolRegistry with all built-in tools.
pub fn create_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(WordCounterTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_word_counter() {
        let registry = create_default_registry();
        assert_eq!(registry.names(), [word_counter::NAME]);
    }
}
