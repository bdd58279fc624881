//! Template rendering for adapter prompts and output locations.

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

/// Template engine wrapper around minijinja.
///
/// Auto-escaping is off: instructions are plain text, not markup. Undefined
/// variables are errors so a typo in an adapter fails loudly instead of
/// rendering an empty string.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    pub fn render<S: Serialize>(
        &self,
        template: &str,
        context: &S,
    ) -> Result<String, minijinja::Error> {
        self.env.render_str(template, context)
    }
}
