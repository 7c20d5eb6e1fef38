use async_trait::async_trait;

use scribe_core::tools::{require_str, Tool, ToolFailure};

pub const NAME: &str = "word_counter";

/// Reports the length of a text in characters.
pub struct WordCounterTool;

impl WordCounterTool {
    pub fn count(text: &str) -> usize {
        text.chars().count()
    }
}

#[async_trait]
impl Tool for WordCounterTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Count the length of a text. Use it whenever you need to know how long a piece of writing is."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["text"],
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to measure"
                }
            }
        })
    }

    async fn execute(&self, args: serde_json::Value) -> Result<String, ToolFailure> {
        let text = require_str(&args, "text")?;
        Ok(format!("Current text length: {} characters.", Self::count(text)))
    }
}
