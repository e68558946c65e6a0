//! Services layer for developer-key-service.
//!
//! Binding resolution, authorization, key lifecycle, external tool
//! propagation and token issuance over the storage traits in [`store`].

pub mod account_chain;
pub mod authorizer;
pub mod binding_resolver;
pub mod cache;
pub mod developer_keys;
pub mod error;
pub mod error_reporter;
pub mod jobs;
pub mod memory;
pub mod metrics;
pub mod special_keys;
pub mod store;
pub mod token;
pub mod tool_lifecycle;
pub mod topology;

pub use account_chain::AccountChainResolver;
pub use authorizer::KeyAuthorizer;
pub use binding_resolver::BindingResolver;
pub use cache::{CacheBackend, DeveloperKeyCache, MemoryCache, RedisCache};
pub use developer_keys::DeveloperKeyService;
pub use error::ServiceError;
pub use error_reporter::{ErrorReporter, MockErrorReporter, TracingErrorReporter};
pub use jobs::{JobQueue, JobQueueConfig};
pub use memory::MemoryStore;
pub use special_keys::SpecialKeyRegistry;
pub use store::Stores;
pub use token::{Jwks, TokenIssuer};
pub use tool_lifecycle::{
    ToolAction, ToolLifecycleCoordinator, ToolManagementConfig, ToolManagementDispatch,
};
pub use topology::{StaticTopology, TopologyProvider};
