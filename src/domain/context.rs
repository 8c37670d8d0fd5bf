//! Payload shown to an annotator and carried into the resulting record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Descriptive metadata about an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Friendly name (e.g. a company name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Domain of the entity (e.g. "foo.com")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl EntityMeta {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.domain.is_none()
    }
}

/// Context attached to a request and copied over to the annotation.
///
/// Known fields are typed; anything else lands in `extra` and is passed
/// through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationContext {
    /// Text the annotator reads (also the training text on export)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "EntityMeta::is_empty")]
    pub meta: EntityMeta,

    /// Free-form passthrough fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationContext {
    /// Create a context holding only text
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Set the entity domain
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.meta.domain = Some(domain.into());
        self
    }

    /// Set the entity name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = Some(name.into());
        self
    }

    /// Key identifying the entity this context describes.
    ///
    /// Domain wins over name; an explicit `entity` string in the extra
    /// fields is the last resort.
    pub fn entity_key(&self) -> Option<String> {
        self.meta
            .domain
            .clone()
            .or_else(|| self.meta.name.clone())
            .or_else(|| {
                self.extra
                    .get("entity")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .filter(|key| !key.trim().is_empty())
    }

    /// Overlay a submitted context on top of this one.
    ///
    /// Submitted fields win when present; extra maps merge key by key.
    pub fn merged_with(&self, submitted: &AnnotationContext) -> AnnotationContext {
        let mut merged = self.clone();

        if submitted.text.is_some() {
            merged.text = submitted.text.clone();
        }
        if submitted.meta.name.is_some() {
            merged.meta.name = submitted.meta.name.clone();
        }
        if submitted.meta.domain.is_some() {
            merged.meta.domain = submitted.meta.domain.clone();
        }
        for (key, value) in &submitted.extra {
            merged.extra.insert(key.clone(), value.clone());
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_pass_through() {
        let json = r#"{"text":"A quick brown fox.","meta":{"name":"Fox Inc","domain":"fox.com"},"score":0.7}"#;
        let context: AnnotationContext = serde_json::from_str(json).unwrap();

        assert_eq!(context.text.as_deref(), Some("A quick brown fox."));
        assert_eq!(context.meta.domain.as_deref(), Some("fox.com"));
        assert_eq!(context.extra.get("score"), Some(&serde_json::json!(0.7)));

        let back = serde_json::to_value(&context).unwrap();
        assert_eq!(back["score"], serde_json::json!(0.7));
    }

    #[test]
    fn test_entity_key_precedence() {
        let context = AnnotationContext::with_text("t")
            .with_name("Fox Inc")
            .with_domain("fox.com");
        assert_eq!(context.entity_key(), Some("fox.com".to_string()));

        let context = AnnotationContext::with_text("t").with_name("Fox Inc");
        assert_eq!(context.entity_key(), Some("Fox Inc".to_string()));

        let mut context = AnnotationContext::with_text("t");
        assert_eq!(context.entity_key(), None);
        context
            .extra
            .insert("entity".to_string(), serde_json::json!("e1"));
        assert_eq!(context.entity_key(), Some("e1".to_string()));
    }

    #[test]
    fn test_merge_prefers_submitted_fields() {
        let mut original = AnnotationContext::with_text("original").with_domain("fox.com");
        original
            .extra
            .insert("source".to_string(), serde_json::json!("crawl"));

        let mut submitted = AnnotationContext::default();
        submitted
            .extra
            .insert("note".to_string(), serde_json::json!("looks right"));
        submitted
            .extra
            .insert("source".to_string(), serde_json::json!("annotator"));

        let merged = original.merged_with(&submitted);
        assert_eq!(merged.text.as_deref(), Some("original"));
        assert_eq!(merged.meta.domain.as_deref(), Some("fox.com"));
        assert_eq!(merged.extra["note"], serde_json::json!("looks right"));
        assert_eq!(merged.extra["source"], serde_json::json!("annotator"));
    }
}
