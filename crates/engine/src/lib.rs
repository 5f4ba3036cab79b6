//! Business layer of the persona engine: validated mutations over the system
//! of record, resolution of agent configs into effective configurations, the
//! cache tier and its sync coordinator, and the audit query facade.

pub mod audit;
pub mod cache;
pub mod repository;
pub mod resolver;
pub mod sync;
pub mod telemetry;

pub use audit::AuditLog;
pub use cache::{CacheError, ConfigCache, InMemoryCache, NoopCache};
pub use repository::ConfigRepository;
pub use resolver::{CachedStoreSource, ComponentSource, Resolver, StoreSource};
pub use sync::SyncCoordinator;
pub use telemetry::{init_tracing, LogFormat};
