//! Named prompt templates with `{{VAR}}` interpolation.
//!
//! Templates are opaque text loaded from a directory when one is
//! configured, falling back to the compiled-in defaults. Loads are
//! cached for the life of the store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    ("filter", include_str!("../../prompts/filter.txt")),
    ("categorize", include_str!("../../prompts/categorize.txt")),
    ("summarize_daily", include_str!("../../prompts/summarize_daily.txt")),
    ("summarize_weekly", include_str!("../../prompts/summarize_weekly.txt")),
    ("extract_quote", include_str!("../../prompts/extract_quote.txt")),
    (
        "extract_announcement",
        include_str!("../../prompts/extract_announcement.txt"),
    ),
    ("extract_faq", include_str!("../../prompts/extract_faq.txt")),
    ("format_social", include_str!("../../prompts/format_social.txt")),
];

pub struct PromptStore {
    dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, String>>,
}

impl PromptStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compiled-in templates only.
    pub fn builtin() -> Self {
        Self::new(None)
    }

    fn load(&self, name: &str) -> anyhow::Result<String> {
        if let Some(cached) = self.cache.lock().unwrap().get(name) {
            return Ok(cached.clone());
        }

        let template = self
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{name}.txt")))
            .filter(|path| path.exists())
            .map(std::fs::read_to_string)
            .transpose()?
            .or_else(|| {
                BUILTIN_TEMPLATES
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, text)| text.to_string())
            })
            .ok_or_else(|| anyhow::anyhow!("unknown prompt template '{name}'"))?;

        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), template.clone());
        Ok(template)
    }

    /// Replace every `{{NAME}}` with its supplied value: strings
    /// verbatim, other scalars via display, containers as JSON.
    /// Placeholders with no supplied value stay verbatim.
    pub fn render(&self, name: &str, vars: &[(&str, Value)]) -> anyhow::Result<String> {
        let mut rendered = self.load(name)?;
        for (key, value) in vars {
            let token = format!("{{{{{key}}}}}");
            let replacement = match value {
                Value::String(text) => text.clone(),
                Value::Array(_) | Value::Object(_) => serde_json::to_string(value)?,
                scalar => scalar.to_string(),
            };
            rendered = rendered.replace(&token, &replacement);
        }
        Ok(rendered)
    }
}
