//! End-to-end behavior of the repository, resolver, cache tier and sync
//! coordinator against a real in-memory SQLite system of record.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use persona_core::config::{ConsistencyMode, EngineConfig};
use persona_core::domain::agent::{AgentConfig, AgentConfigId, AgentConfigPatch, ToolCallStrategy};
use persona_core::domain::changelog::{EntityKind, MutationContext, Operation};
use persona_core::domain::llm::{LlmConfig, LlmConfigId};
use persona_core::domain::profile::{AgentProfile, ProfileId};
use persona_core::domain::template::{PromptTemplate, TemplateDraft, TemplateId};
use persona_core::errors::ConfigError;
use persona_core::slots::{PromptSlot, PromptType};
use persona_db::repositories::{
    AgentConfigStore, ChangeLogStore, LlmConfigStore, ProfileStore, SqlAgentConfigStore,
    SqlChangeLogStore, SqlLlmConfigStore, SqlProfileStore, SqlTemplateStore, TemplateStore,
};
use persona_db::{connect_with, migrations, DbPool, PoolSettings};
use persona_engine::{
    AuditLog, CachedStoreSource, ConfigCache, ConfigRepository, InMemoryCache, Resolver,
    StoreSource, SyncCoordinator,
};

struct Engine {
    repository: ConfigRepository,
    resolver: Resolver,
    audit: AuditLog,
    cache: Arc<InMemoryCache>,
}

async fn pool() -> DbPool {
    let pool = connect_with("sqlite::memory:", &PoolSettings::single_connection()).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    pool
}

fn build_engine(pool: &DbPool, config: EngineConfig) -> Engine {
    let templates: Arc<dyn TemplateStore> = Arc::new(SqlTemplateStore::new(pool.clone()));
    let llm_configs: Arc<dyn LlmConfigStore> = Arc::new(SqlLlmConfigStore::new(pool.clone()));
    let agents: Arc<dyn AgentConfigStore> = Arc::new(SqlAgentConfigStore::new(pool.clone()));
    let profiles: Arc<dyn ProfileStore> = Arc::new(SqlProfileStore::new(pool.clone()));
    let change_log: Arc<dyn ChangeLogStore> = Arc::new(SqlChangeLogStore::new(pool.clone()));

    let cache = Arc::new(InMemoryCache::default());
    let coordinator = Arc::new(SyncCoordinator::new(cache.clone(), config.cache.clone()));

    let repository = ConfigRepository::new(
        templates.clone(),
        llm_configs.clone(),
        agents.clone(),
        profiles.clone(),
        change_log.clone(),
        &config,
    )
    .with_coordinator(coordinator.clone());

    let source = StoreSource::new(templates, llm_configs, agents, profiles);
    let cached_source = CachedStoreSource::new(source, cache.clone(), config.clone());
    let resolver = Resolver::new(Arc::new(cached_source), cache.clone(), coordinator, config);

    Engine { repository, resolver, audit: AuditLog::new(change_log), cache }
}

async fn engine() -> Engine {
    build_engine(&pool().await, EngineConfig::default())
}

fn ctx() -> MutationContext {
    MutationContext::by("tests@example.com")
}

async fn create_template(engine: &Engine, name: &str, kind: PromptType) -> PromptTemplate {
    engine
        .repository
        .create_template(
            TemplateDraft::new(name, format!("{name} content"), kind),
            &ctx(),
        )
        .await
        .expect("create template")
}

async fn create_llm(engine: &Engine) -> LlmConfig {
    let now = Utc::now();
    engine
        .repository
        .create_llm_config(
            LlmConfig {
                id: LlmConfigId(Uuid::new_v4().to_string()),
                name: format!("llm-{}", Uuid::new_v4()),
                llm_type: "openai".to_string(),
                model_name: "gpt-4o".to_string(),
                temperature: 0.7,
                max_tokens: Some(4096),
                api_key: None,
                base_url: None,
                timeout_secs: 30,
                max_retries: 2,
                extra_params: serde_json::json!({}),
                description: None,
                is_usable: true,
                created_at: now,
                updated_at: now,
            },
            &ctx(),
        )
        .await
        .expect("create llm config")
}

fn agent_config(name: &str, role: &TemplateId, llm: &LlmConfigId) -> AgentConfig {
    let now = Utc::now();
    AgentConfig {
        id: AgentConfigId(Uuid::new_v4().to_string()),
        name: name.to_string(),
        agent_type: "chat".to_string(),
        role_definition_id: role.clone(),
        reasoning_framework_id: None,
        retrieval_strategy_id: None,
        safety_policy_id: None,
        process_guide_id: None,
        llm_config_id: llm.clone(),
        enabled_tools: BTreeSet::from(["kb_search".to_string()]),
        tool_call_strategy: ToolCallStrategy::Auto,
        max_iterations: 10,
        timeout_secs: 60,
        extra_params: serde_json::json!({}),
        description: None,
        is_usable: true,
        revision: 1,
        created_at: now,
        updated_at: now,
    }
}

fn profile_for(agent: &AgentConfigId, style: Option<TemplateId>) -> AgentProfile {
    let now = Utc::now();
    AgentProfile {
        id: ProfileId(Uuid::new_v4().to_string()),
        agent_config_id: agent.clone(),
        display_name: "Test Agent".to_string(),
        avatar_url: None,
        language: "en".to_string(),
        communication_style_id: style,
        personality_tags: BTreeSet::new(),
        expertise_domains: serde_json::json!([]),
        max_context_length: None,
        is_public: true,
        custom_metadata: serde_json::json!({}),
        is_usable: true,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn valid_creation_always_resolves() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let safety = create_template(&engine, "safety", PromptType::SafetyPolicy).await;
    let llm = create_llm(&engine).await;

    let mut config = agent_config("support-bot", &role.id, &llm.id);
    config.safety_policy_id = Some(safety.id.clone());
    let created =
        engine.repository.create_agent_config(config, &ctx()).await.expect("create agent");

    let effective = engine.resolver.resolve(&created.id).await.expect("resolve");
    assert_eq!(effective.sections.len(), 2);
    assert!(!effective.content_hash.is_empty());
}

#[tokio::test]
async fn role_only_config_yields_exactly_one_section() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;

    let created = engine
        .repository
        .create_agent_config(agent_config("minimal", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    let effective = engine.resolver.resolve(&created.id).await.expect("resolve");
    assert_eq!(effective.sections.len(), 1);
    assert_eq!(effective.sections[0].slot, PromptSlot::RoleDefinition);
}

#[tokio::test]
async fn role_delete_is_blocked_but_optional_delete_clears_the_slot() {
    let db = pool().await;
    let engine = build_engine(&db, EngineConfig::default());
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let reasoning = create_template(&engine, "cot", PromptType::ReasoningFramework).await;
    let llm = create_llm(&engine).await;

    let mut config = agent_config("support-bot", &role.id, &llm.id);
    config.reasoning_framework_id = Some(reasoning.id.clone());
    let created =
        engine.repository.create_agent_config(config, &ctx()).await.expect("create agent");

    let blocked = engine
        .repository
        .delete_template(&role.id, &ctx())
        .await
        .expect_err("role delete must block");
    assert!(matches!(blocked, ConfigError::ReferentialIntegrity(_)));

    engine
        .repository
        .delete_template(&reasoning.id, &ctx())
        .await
        .expect("optional delete succeeds");

    let agents = SqlAgentConfigStore::new(db.clone());
    let stored = agents.find_by_id(&created.id).await.expect("find").expect("exists");
    assert_eq!(stored.reasoning_framework_id, None);
    assert_eq!(stored.revision, 2);
}

#[tokio::test]
async fn every_mistyped_slot_assignment_is_rejected() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;

    let all_types = [
        PromptType::RoleDefinition,
        PromptType::ReasoningFramework,
        PromptType::CommunicationStyle,
        PromptType::RetrievalStrategy,
        PromptType::SafetyPolicy,
        PromptType::ProcessGuide,
    ];
    let mut by_type = Vec::new();
    for kind in all_types {
        by_type.push((kind, create_template(&engine, &format!("t-{kind}"), kind).await));
    }

    for slot in PromptSlot::SECTION_ORDER {
        for (kind, template) in &by_type {
            if *kind == slot.expected_type() {
                continue;
            }
            let error = match slot {
                PromptSlot::CommunicationStyle => {
                    // The style slot lives on the profile.
                    let owner = engine
                        .repository
                        .create_agent_config(
                            agent_config(&format!("owner-{kind}"), &role.id, &llm.id),
                            &ctx(),
                        )
                        .await
                        .expect("create owner");
                    engine
                        .repository
                        .create_profile(
                            profile_for(&owner.id, Some(template.id.clone())),
                            &ctx(),
                        )
                        .await
                        .expect_err("mistyped style must fail")
                }
                _ => {
                    let mut config =
                        agent_config(&format!("agent-{slot}-{kind}"), &role.id, &llm.id);
                    match slot {
                        PromptSlot::RoleDefinition => {
                            config.role_definition_id = template.id.clone()
                        }
                        PromptSlot::SafetyPolicy => {
                            config.safety_policy_id = Some(template.id.clone())
                        }
                        PromptSlot::ReasoningFramework => {
                            config.reasoning_framework_id = Some(template.id.clone())
                        }
                        PromptSlot::RetrievalStrategy => {
                            config.retrieval_strategy_id = Some(template.id.clone())
                        }
                        PromptSlot::ProcessGuide => {
                            config.process_guide_id = Some(template.id.clone())
                        }
                        PromptSlot::CommunicationStyle => unreachable!(),
                    }
                    engine
                        .repository
                        .create_agent_config(config, &ctx())
                        .await
                        .expect_err("mistyped slot must fail")
                }
            };
            assert!(
                matches!(error, ConfigError::TypeMismatch { .. }),
                "slot {slot} with {kind} produced {error:?}"
            );
        }
    }
}

#[tokio::test]
async fn mistyped_role_persists_nothing() {
    let db = pool().await;
    let engine = build_engine(&db, EngineConfig::default());
    let style = create_template(&engine, "tone", PromptType::CommunicationStyle).await;
    let llm = create_llm(&engine).await;

    let error = engine
        .repository
        .create_agent_config(agent_config("broken", &style.id, &llm.id), &ctx())
        .await
        .expect_err("role slot cannot hold a style template");
    assert!(matches!(error, ConfigError::TypeMismatch { .. }));

    let agents = SqlAgentConfigStore::new(db.clone());
    assert!(agents.find_by_name("broken").await.expect("find").is_none());
}

#[tokio::test]
async fn sections_follow_fixed_precedence() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let safety = create_template(&engine, "safety", PromptType::SafetyPolicy).await;
    let reasoning = create_template(&engine, "cot", PromptType::ReasoningFramework).await;
    let retrieval = create_template(&engine, "rag", PromptType::RetrievalStrategy).await;
    let process = create_template(&engine, "steps", PromptType::ProcessGuide).await;
    let style = create_template(&engine, "tone", PromptType::CommunicationStyle).await;
    let llm = create_llm(&engine).await;

    let mut config = agent_config("full", &role.id, &llm.id);
    config.safety_policy_id = Some(safety.id.clone());
    config.reasoning_framework_id = Some(reasoning.id.clone());
    config.retrieval_strategy_id = Some(retrieval.id.clone());
    config.process_guide_id = Some(process.id.clone());
    let created =
        engine.repository.create_agent_config(config, &ctx()).await.expect("create agent");
    engine
        .repository
        .create_profile(profile_for(&created.id, Some(style.id.clone())), &ctx())
        .await
        .expect("create profile");

    let effective = engine.resolver.resolve(&created.id).await.expect("resolve");
    let slots: Vec<PromptSlot> = effective.sections.iter().map(|s| s.slot).collect();
    assert_eq!(
        slots,
        vec![
            PromptSlot::RoleDefinition,
            PromptSlot::SafetyPolicy,
            PromptSlot::ReasoningFramework,
            PromptSlot::RetrievalStrategy,
            PromptSlot::ProcessGuide,
            PromptSlot::CommunicationStyle,
        ]
    );
}

#[tokio::test]
async fn concurrent_stale_updates_yield_exactly_one_conflict() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    let created = engine
        .repository
        .create_agent_config(agent_config("racer", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    let first_patch =
        AgentConfigPatch { max_iterations: Some(20), ..AgentConfigPatch::default() };
    let second_patch =
        AgentConfigPatch { max_iterations: Some(30), ..AgentConfigPatch::default() };

    let first_ctx = ctx();
    let second_ctx = ctx();
    let (first, second) = tokio::join!(
        engine.repository.update_agent_config(&created.id, first_patch, 1, &first_ctx),
        engine.repository.update_agent_config(&created.id, second_patch, 1, &second_ctx),
    );

    let outcomes = [first, second];
    let successes = outcomes.iter().filter(|o| o.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|o| matches!(o, Err(ConfigError::Conflict { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn cache_never_changes_resolution_semantics() {
    let db = pool().await;
    let with_cache = build_engine(&db, EngineConfig::default());
    let role = create_template(&with_cache, "role", PromptType::RoleDefinition).await;
    let safety = create_template(&with_cache, "safety", PromptType::SafetyPolicy).await;
    let llm = create_llm(&with_cache).await;
    let mut config = agent_config("support-bot", &role.id, &llm.id);
    config.safety_policy_id = Some(safety.id.clone());
    let created =
        with_cache.repository.create_agent_config(config, &ctx()).await.expect("create agent");

    let mut no_cache_config = EngineConfig::default();
    no_cache_config.cache.enabled = false;
    let without_cache = build_engine(&db, no_cache_config);

    let cached = with_cache.resolver.resolve(&created.id).await.expect("resolve cached");
    let cached_again = with_cache.resolver.resolve(&created.id).await.expect("cache hit");
    let uncached = without_cache.resolver.resolve(&created.id).await.expect("resolve uncached");

    assert_eq!(cached, uncached);
    assert_eq!(cached, cached_again);
    assert_eq!(
        serde_json::to_vec(&cached).expect("serialize"),
        serde_json::to_vec(&uncached).expect("serialize"),
    );
}

#[tokio::test]
async fn write_through_invalidation_is_visible_immediately() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let safety = create_template(&engine, "safety", PromptType::SafetyPolicy).await;
    let llm = create_llm(&engine).await;
    let mut config = agent_config("support-bot", &role.id, &llm.id);
    config.safety_policy_id = Some(safety.id.clone());
    let created =
        engine.repository.create_agent_config(config, &ctx()).await.expect("create agent");

    let before = engine.resolver.resolve(&created.id).await.expect("resolve");
    assert_eq!(before.sections.len(), 2);

    engine
        .repository
        .set_template_active(&safety.id, false, &ctx())
        .await
        .expect("deactivate safety");

    // Write-through: no TTL wait; the next read reflects the mutation.
    let after = engine.resolver.resolve(&created.id).await.expect("resolve");
    assert_eq!(after.sections.len(), 1);
    assert_ne!(before.content_hash, after.content_hash);
}

#[tokio::test]
async fn write_behind_staleness_is_bounded_by_the_ttl() {
    let db = pool().await;
    let mut config = EngineConfig::default();
    config.consistency = ConsistencyMode::WriteBehind;
    config.cache.ttl_secs = 60;
    let engine = build_engine(&db, config);

    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let safety = create_template(&engine, "safety", PromptType::SafetyPolicy).await;
    let llm = create_llm(&engine).await;
    let mut agent = agent_config("support-bot", &role.id, &llm.id);
    agent.safety_policy_id = Some(safety.id.clone());
    let created =
        engine.repository.create_agent_config(agent, &ctx()).await.expect("create agent");

    let before = engine.resolver.resolve(&created.id).await.expect("resolve");
    assert_eq!(before.sections.len(), 2);

    // No event-loop consumer is running, so nothing invalidates the cache.
    engine
        .repository
        .set_template_active(&safety.id, false, &ctx())
        .await
        .expect("deactivate safety");

    let stale = engine.resolver.resolve(&created.id).await.expect("resolve stale");
    assert_eq!(stale.sections.len(), 2);

    // Pause only after setup: establishing sqlx connections spins up real OS
    // threads whose acquire timeouts fire instantly under a paused clock.
    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(61)).await;

    let fresh = engine.resolver.resolve(&created.id).await.expect("resolve fresh");
    assert_eq!(fresh.sections.len(), 1);
}

#[tokio::test]
async fn write_behind_event_loop_converges_before_the_ttl() {
    let db = pool().await;
    let mut config = EngineConfig::default();
    config.consistency = ConsistencyMode::WriteBehind;
    let engine = build_engine(&db, config.clone());

    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    let created = engine
        .repository
        .create_agent_config(agent_config("support-bot", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    let coordinator = Arc::new(SyncCoordinator::new(engine.cache.clone(), config.cache));
    let events = engine.repository.subscribe();
    let loop_handle = tokio::spawn(coordinator.clone().run(events));

    engine.resolver.resolve(&created.id).await.expect("resolve");
    engine
        .repository
        .delete_agent_config(&created.id, &ctx())
        .await
        .expect("delete agent");

    // Give the event loop a chance to drain the channel.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let key = format!("effective:{}", created.id.0);
    assert!(engine.cache.get(&key).await.expect("cache get").is_none());

    let error = engine.resolver.resolve(&created.id).await.expect_err("agent is gone");
    assert!(matches!(error, ConfigError::NotFound { .. }));
    loop_handle.abort();
}

#[tokio::test]
async fn every_mutation_appends_exactly_one_change_log_entry() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    let created = engine
        .repository
        .create_agent_config(agent_config("audited", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    engine
        .repository
        .update_agent_config(
            &created.id,
            AgentConfigPatch { max_iterations: Some(25), ..AgentConfigPatch::default() },
            1,
            &ctx(),
        )
        .await
        .expect("update agent");

    let entries = engine
        .audit
        .query(EntityKind::AgentConfig, &created.id.0, None)
        .await
        .expect("audit query");
    assert_eq!(entries.len(), 2);

    let update = &entries[0];
    assert_eq!(update.operation, Operation::Update);
    assert_eq!(update.old_values.as_ref().expect("old")["max_iterations"], 10);
    assert_eq!(update.new_values.as_ref().expect("new")["max_iterations"], 25);
    assert_eq!(update.actor.as_deref(), Some("tests@example.com"));

    let create = &entries[1];
    assert_eq!(create.operation, Operation::Create);
    assert!(create.old_values.is_none());
    assert_eq!(create.new_values.as_ref().expect("new")["revision"], 1);
}

#[tokio::test]
async fn restore_reapplies_a_prior_snapshot_as_a_new_mutation() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    let created = engine
        .repository
        .create_agent_config(agent_config("rollback", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    engine
        .repository
        .update_agent_config(
            &created.id,
            AgentConfigPatch { max_iterations: Some(99), ..AgentConfigPatch::default() },
            1,
            &ctx(),
        )
        .await
        .expect("update agent");

    let latest = engine
        .audit
        .latest(EntityKind::AgentConfig, &created.id.0)
        .await
        .expect("audit")
        .expect("entry exists");
    let prior = latest.old_values.expect("prior snapshot");

    let restored = engine
        .repository
        .restore_agent_config(&created.id, &prior, 2, &ctx())
        .await
        .expect("restore");
    assert_eq!(restored.max_iterations, 10);
    assert_eq!(restored.revision, 3);

    let entries = engine
        .audit
        .query(EntityKind::AgentConfig, &created.id.0, None)
        .await
        .expect("audit query");
    assert_eq!(entries.len(), 3, "rollback is a new mutation, not a log edit");
}

#[tokio::test]
async fn duplicate_profile_for_one_agent_is_a_uniqueness_violation() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    let created = engine
        .repository
        .create_agent_config(agent_config("owner", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    engine
        .repository
        .create_profile(profile_for(&created.id, None), &ctx())
        .await
        .expect("first profile");
    let error = engine
        .repository
        .create_profile(profile_for(&created.id, None), &ctx())
        .await
        .expect_err("second profile must fail");
    assert!(matches!(error, ConfigError::UniquenessViolation(_)));
}

#[tokio::test]
async fn template_names_version_rather_than_mutate() {
    let engine = engine().await;
    create_template(&engine, "role", PromptType::RoleDefinition).await;

    let duplicate = engine
        .repository
        .create_template(
            TemplateDraft::new("role", "other content", PromptType::RoleDefinition),
            &ctx(),
        )
        .await
        .expect_err("existing name must version instead");
    assert!(matches!(duplicate, ConfigError::UniquenessViolation(_)));

    let v2 = engine
        .repository
        .create_template_version(
            TemplateDraft::new("role", "revised content", PromptType::RoleDefinition),
            &ctx(),
        )
        .await
        .expect("new version");
    assert_eq!(v2.version, 2);
}

#[tokio::test]
async fn llm_config_delete_is_blocked_while_referenced() {
    let engine = engine().await;
    let role = create_template(&engine, "role", PromptType::RoleDefinition).await;
    let llm = create_llm(&engine).await;
    engine
        .repository
        .create_agent_config(agent_config("holder", &role.id, &llm.id), &ctx())
        .await
        .expect("create agent");

    let error = engine
        .repository
        .delete_llm_config(&llm.id, &ctx())
        .await
        .expect_err("referenced llm config must not delete");
    assert!(matches!(error, ConfigError::ReferentialIntegrity(_)));
}
