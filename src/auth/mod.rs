//! Device-code authentication: attempts, orchestration, sessions' inputs.

pub mod attempt;
pub mod cookies;
pub mod credentials;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod roles;

pub use attempt::{AttemptState, AuthAttempt, AuthAttemptStore};
pub use error::LoginError;
pub use middleware::{CurrentUser, RequireAdmin};
pub use orchestrator::DeviceLoginOrchestrator;
pub use roles::RoleResolver;
