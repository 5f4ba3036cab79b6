pub mod config;
pub mod domain;
pub mod effective;
pub mod errors;
pub mod events;
pub mod slots;

pub use config::{CacheSettings, ConfigLoadError, ConsistencyMode, EngineConfig, OptionalSlotPolicy};
pub use domain::agent::{AgentConfig, AgentConfigId, AgentConfigPatch, ToolCallStrategy};
pub use domain::changelog::{ChangeLogEntry, EntityKind, MutationContext, Operation};
pub use domain::llm::{LlmConfig, LlmConfigId, LlmParameters};
pub use domain::profile::{AgentProfile, ProfileId};
pub use domain::template::{PromptTemplate, TemplateDraft, TemplateId};
pub use effective::{EffectiveConfig, PromptSection};
pub use errors::ConfigError;
pub use events::MutationEvent;
pub use slots::{PromptSlot, PromptType};
