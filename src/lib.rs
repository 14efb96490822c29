#![doc = include_str!("../README.md")]

#[cfg(feature = "http")]
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod guard;
pub mod notify;
pub mod permissions;
pub mod state;
pub mod storage;
pub mod token;
pub mod traits;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
#[cfg(feature = "http")]
pub use api::ApiClient;
pub use auth::{AuthService, LoginOutcome};
pub use config::{ApiConfig, SessionConfig, StaleCachePolicy};
pub use error::Error;
pub use guard::{GuardDecision, GuardRejection, RouteGuard};
pub use notify::{Notice, NoticeLevel, Notifier, TracingNotifier};
pub use permissions::{PermissionService, PermissionSet, PermissionSnapshot};
pub use state::{AuthAction, AuthPhase, AuthState, reduce};
pub use storage::{MemoryStorage, Storage, UserCache};
pub use token::{CookieTokenStore, TokenStore};
pub use traits::{AuthBackend, PermissionBackend, ProfileBackend};
pub use types::{
    AuthToken, Credentials, GroupedPermissions, LoginResponse, PasswordChange, Permission,
    ProfileUpdate, RoleRef, UserId, UserSummary,
};
