//! The `Tools` capability the ToC-finder agent drives: it calls a
//! `propose_toc_page_range` tool until the model is satisfied, then a
//! `done` tool to end the conversation.

use std::sync::Mutex;

use foliant_agent::Tools;
use foliant_domain::ToolDefinition;
use serde_json::{json, Value};

pub struct TocFinderTools {
    proposals: Mutex<Vec<Value>>,
    done: Mutex<bool>,
}

impl Default for TocFinderTools {
    fn default() -> Self {
        Self {
            proposals: Mutex::new(Vec::new()),
            done: Mutex::new(false),
        }
    }
}

#[async_trait::async_trait]
impl Tools for TocFinderTools {
    fn schema(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "propose_toc_page_range".to_string(),
                description: "Propose a page range that looks like a table of contents".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "start_page": { "type": "integer" },
                        "end_page": { "type": "integer" },
                    },
                    "required": ["start_page", "end_page"],
                }),
            },
            ToolDefinition {
                name: "done".to_string(),
                description: "Signal that the table of contents has been located".to_string(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        match name {
            "propose_toc_page_range" => {
                self.proposals.lock().unwrap().push(args);
                Ok("{}".to_string())
            }
            "done" => {
                *self.done.lock().unwrap() = true;
                Ok("{}".to_string())
            }
            other => Err(format!("permanent: unknown tool {other}")),
        }
    }

    fn is_complete(&self) -> bool {
        *self.done.lock().unwrap()
    }

    fn result(&self) -> Value {
        json!({ "proposals": self.proposals.lock().unwrap().clone() })
    }
}
