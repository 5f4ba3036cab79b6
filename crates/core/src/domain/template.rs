use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slots::PromptType;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

/// One published version of a prompt component. Content is immutable once
/// published; a content change is a new `(name, version)` row. Only the
/// activation flag and descriptive metadata mutate in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: TemplateId,
    pub name: String,
    pub version: i64,
    pub template: String,
    pub description: Option<String>,
    pub category: String,
    pub variables: serde_json::Value,
    pub prompt_type: PromptType,
    pub usage_guidance: Option<String>,
    pub is_required: bool,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author-supplied fields for a new template or a new version of an existing
/// name. Identity, revision bookkeeping and timestamps are assigned by the
/// repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub template: String,
    pub prompt_type: PromptType,
    pub description: Option<String>,
    pub category: String,
    pub variables: serde_json::Value,
    pub usage_guidance: Option<String>,
    pub is_required: bool,
    pub created_by: Option<String>,
}

impl TemplateDraft {
    pub fn new(name: impl Into<String>, template: impl Into<String>, kind: PromptType) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            prompt_type: kind,
            description: None,
            category: "general".to_string(),
            variables: serde_json::json!({}),
            usage_guidance: None,
            is_required: kind == PromptType::RoleDefinition,
            created_by: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
