use super::message::ChatMessage;

/// Parameters for one generation call.
///
/// Providers start from their configured defaults and apply the caller's
/// [`GenerateOption`]s in order, so a later option overrides an earlier one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    /// Prior conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,
    pub json_mode: bool,
}

/// One caller-supplied override.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateOption {
    Model(String),
    Temperature(f32),
    MaxTokens(u32),
    SystemPrompt(String),
    Messages(Vec<ChatMessage>),
    JsonMode(bool),
}

impl GenerateOption {
    pub fn model(model: impl Into<String>) -> Self {
        GenerateOption::Model(model.into())
    }

    pub fn temperature(temperature: f32) -> Self {
        GenerateOption::Temperature(temperature)
    }

    pub fn max_tokens(max_tokens: u32) -> Self {
        GenerateOption::MaxTokens(max_tokens)
    }

    pub fn system_prompt(prompt: impl Into<String>) -> Self {
        GenerateOption::SystemPrompt(prompt.into())
    }

    pub fn messages(messages: Vec<ChatMessage>) -> Self {
        GenerateOption::Messages(messages)
    }

    pub fn json_mode(enabled: bool) -> Self {
        GenerateOption::JsonMode(enabled)
    }
}

impl GenerateOptions {
    /// Apply `opts` on top of `self`, last writer wins.
    pub fn apply(mut self, opts: &[GenerateOption]) -> Self {
        for opt in opts {
            match opt {
                GenerateOption::Model(model) => self.model = model.clone(),
                GenerateOption::Temperature(t) => self.temperature = *t,
                GenerateOption::MaxTokens(n) => self.max_tokens = *n,
                GenerateOption::SystemPrompt(prompt) => {
                    self.system_prompt = Some(prompt.clone()).filter(|p| !p.is_empty())
                }
                GenerateOption::Messages(messages) => self.messages = messages.clone(),
                GenerateOption::JsonMode(enabled) => self.json_mode = *enabled,
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> GenerateOptions {
        GenerateOptions {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.3,
            max_tokens: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_keeps_defaults_without_options() {
        let options = defaults().apply(&[]);
        assert_eq!(options, defaults());
    }

    #[test]
    fn test_last_writer_wins() {
        let options = defaults().apply(&[
            GenerateOption::model("gpt-4"),
            GenerateOption::temperature(0.9),
            GenerateOption::model("gpt-4o-mini"),
            GenerateOption::json_mode(true),
        ]);
        assert_eq!(options.model, "gpt-4o-mini");
        assert_eq!(options.temperature, 0.9);
        assert_eq!(options.max_tokens, 1000);
        assert!(options.json_mode);
    }

    #[test]
    fn test_empty_system_prompt_is_ignored() {
        let options = defaults().apply(&[GenerateOption::system_prompt("")]);
        assert!(options.system_prompt.is_none());
    }
}
