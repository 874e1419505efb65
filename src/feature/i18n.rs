//! Feature labels per language.
//!
//! Each module ships one JSON document keyed by language code:
//!
//! ```json
//! {
//!   "zh-TW": {
//!     "module": { "name": "全域", "description": "..." },
//!     "groups": { "event-hook": "事件" },
//!     "event-hook": { "copy": { "name": "允許複製", "description": "..." } }
//!   }
//! }
//! ```
//!
//! Missing translations fall back to the default language, then to the id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Language used when nothing better matches.
pub const DEFAULT_LANGUAGE: &str = "zh-TW";

/// Languages the platform serves.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "zh-TW", "zh-CN", "zh-MO", "en-US", "en-GB", "th-TH", "id-ID", "ms-MY", "vi-VN",
];

/// Maps a browser language to a supported one.
///
/// Exact matches win, any other `zh*` becomes `zh-TW`, anything else the default.
pub fn resolve_language(language: &str) -> &'static str {
    if let Some(supported) = SUPPORTED_LANGUAGES.iter().find(|l| **l == language) {
        return supported;
    }
    if language.starts_with("zh") {
        return "zh-TW";
    }
    DEFAULT_LANGUAGE
}

/// Name and optional description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Display name.
    pub name: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Label {
    /// Label with only a name.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LabelValue {
    Short(String),
    Full(Label),
}

impl From<&LabelValue> for Label {
    fn from(value: &LabelValue) -> Self {
        match value {
            LabelValue::Short(name) => Label::name(name.clone()),
            LabelValue::Full(label) => label.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ModuleMessages {
    module: Label,
    #[serde(default)]
    groups: HashMap<String, String>,
    #[serde(flatten)]
    features: HashMap<String, HashMap<String, LabelValue>>,
}

/// Translations of one module.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ModuleI18n {
    languages: HashMap<String, ModuleMessages>,
}

impl ModuleI18n {
    /// Parses a module translation document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Languages present in the document.
    pub fn languages(&self) -> Vec<&str> {
        let mut languages: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }

    fn lookup<T>(&self, language: &str, f: impl Fn(&ModuleMessages) -> Option<T>) -> Option<T> {
        self.languages
            .get(language)
            .and_then(&f)
            .or_else(|| self.languages.get(DEFAULT_LANGUAGE).and_then(&f))
    }

    /// Module label, falling back to the module id.
    pub fn module_label(&self, language: &str, module_id: &str) -> Label {
        self.lookup(language, |m| Some(m.module.clone()))
            .unwrap_or_else(|| Label::name(module_id))
    }

    /// Group name, falling back to the group id.
    pub fn group_label(&self, language: &str, group: &str) -> String {
        self.lookup(language, |m| m.groups.get(group).cloned())
            .unwrap_or_else(|| group.to_string())
    }

    /// Feature label, falling back to the feature id.
    pub fn feature_label(&self, language: &str, group: &str, feature: &str) -> Label {
        self.lookup(language, |m| m.features.get(group)?.get(feature).map(Label::from))
            .unwrap_or_else(|| Label::name(feature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "zh-TW": {
            "module": {"name": "全域"},
            "groups": {"event-hook": "事件"},
            "event-hook": {
                "copy": {"name": "允許複製", "description": "允許選取文字"},
                "keep-session-alive": "保持登入"
            }
        },
        "en-US": {
            "module": {"name": "Global", "description": "Site-wide tweaks"},
            "event-hook": {"copy": "Allow copy"}
        }
    }"#;

    #[test]
    fn test_resolve_language() {
        assert_eq!(resolve_language("en-US"), "en-US");
        assert_eq!(resolve_language("zh-HK"), "zh-TW");
        assert_eq!(resolve_language("fr-FR"), DEFAULT_LANGUAGE);
    }

    #[test]
    fn test_labels_and_fallbacks() {
        let i18n = ModuleI18n::from_json(DOC).unwrap();
        assert_eq!(i18n.languages(), vec!["en-US", "zh-TW"]);

        assert_eq!(i18n.module_label("en-US", "global").name, "Global");
        assert_eq!(i18n.feature_label("en-US", "event-hook", "copy").name, "Allow copy");
        // Missing in en-US, present in the default language.
        assert_eq!(i18n.group_label("en-US", "event-hook"), "事件");
        assert_eq!(
            i18n.feature_label("en-US", "event-hook", "keep-session-alive").name,
            "保持登入"
        );
        // Missing everywhere.
        assert_eq!(i18n.feature_label("zh-TW", "menu", "RWD-support").name, "RWD-support");
        assert_eq!(i18n.group_label("zh-TW", "menu"), "menu");
    }

    #[test]
    fn test_empty_document_falls_back_to_ids() {
        let i18n = ModuleI18n::default();
        assert_eq!(i18n.module_label("zh-TW", "exam"), Label::name("exam"));
    }
}
