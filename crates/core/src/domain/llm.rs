use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LlmConfigId(pub String);

/// Model/provider identity plus sampling and retry policy. The api key is
/// held as a secret and is excluded from snapshots, cache entries and the
/// resolved configuration.
#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub id: LlmConfigId,
    pub name: String,
    pub llm_type: String,
    pub model_name: String,
    pub temperature: f64,
    pub max_tokens: Option<i64>,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub timeout_secs: i64,
    pub max_retries: i64,
    pub extra_params: serde_json::Value,
    pub description: Option<String>,
    pub is_usable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LlmConfig {
    /// Everything the resolved configuration carries about the model. The
    /// invocation service fetches credentials from the store by id.
    pub fn parameters(&self) -> LlmParameters {
        LlmParameters {
            llm_config_id: self.id.clone(),
            name: self.name.clone(),
            llm_type: self.llm_type.clone(),
            model_name: self.model_name.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            base_url: self.base_url.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            extra_params: self.extra_params.clone(),
        }
    }

    /// Change-log snapshot. Never includes the api key.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "id": self.id.0,
            "name": self.name,
            "llm_type": self.llm_type,
            "model_name": self.model_name,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "base_url": self.base_url,
            "timeout": self.timeout_secs,
            "max_retries": self.max_retries,
            "extra_params": self.extra_params,
            "description": self.description,
            "is_usable": self.is_usable,
            "api_key_set": self.api_key.is_some(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LlmParameters {
    pub llm_config_id: LlmConfigId,
    pub name: String,
    pub llm_type: String,
    pub model_name: String,
    pub temperature: f64,
    pub max_tokens: Option<i64>,
    pub base_url: Option<String>,
    pub timeout_secs: i64,
    pub max_retries: i64,
    pub extra_params: serde_json::Value,
}
