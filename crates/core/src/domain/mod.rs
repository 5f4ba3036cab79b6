pub mod agent;
pub mod changelog;
pub mod llm;
pub mod profile;
pub mod template;
