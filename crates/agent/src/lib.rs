// Service modules (agent functionality)
pub mod dispatch;
pub mod executor;
pub mod mountinfo;
pub mod process;
pub mod registry;
pub mod secrets;
pub mod service_config;

// Re-exports for consumers (CLI binary, tests)
pub use dispatch::AgentDispatcher;
pub use process::{spawn_service, ServiceError};
pub use registry::{ProcessRecord, ProcessRegistry, RecordSource, RegistryError};
pub use service_config::{Config as ServiceConfig, ConfigError};
