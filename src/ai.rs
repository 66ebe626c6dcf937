use anyhow::Result;
use async_trait::async_trait;

/// Upper bound on raw HTML handed to a model for field extraction.
pub const MAX_AI_HTML_CONTEXT: usize = 6000;

/// Injected language-model capability. The pipeline only ever sends a
/// prompt and reads a short completion; client construction, models and
/// retries live with the caller.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Clip text to `max` characters on a char boundary for prompt embedding.
pub fn truncate_for_prompt(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Scripted client: pops canned responses in order, then errors.
    pub struct ScriptedAi {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedAi {
        pub fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl AiClient for ScriptedAi {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("scripted AI exhausted"))
        }
    }
}
