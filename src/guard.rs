//! Gate for protected views.

use tokio::sync::watch;

use crate::permissions::PermissionSnapshot;
use crate::state::AuthState;

/// What a protected view should do right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// Session or permissions are still loading; show a loading indicator.
    Pending,
    /// Not signed in; send the visitor to `location`.
    Redirect { location: String },
    /// Signed in but lacking `missing`; show an access-denied view.
    Denied { missing: Vec<String> },
    Render,
}

/// Why [`RouteGuard::admit`] refused entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardRejection {
    #[error("Not authenticated")]
    Unauthenticated { location: String },
    #[error("Access denied: missing {}", .missing.join(", "))]
    Forbidden { missing: Vec<String> },
}

/// Gate with an optional list of required permissions.
///
/// The guard owns no session state; it reads the auth and permission
/// snapshots it is given.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    login_path: String,
    required: Vec<String>,
    path: Option<String>,
}

impl RouteGuard {
    #[must_use]
    pub fn new(login_path: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
            required: Vec::new(),
            path: None,
        }
    }

    /// Require every one of `codenames`.
    #[must_use]
    pub fn require<I, S>(mut self, codenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(codenames.into_iter().map(Into::into));
        self
    }

    /// Path being guarded; appended to the login redirect as `next`.
    #[must_use]
    pub fn for_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn required(&self) -> &[String] {
        &self.required
    }

    /// Decide from the current snapshots.
    #[must_use]
    pub fn evaluate(&self, auth: &AuthState, permissions: &PermissionSnapshot) -> GuardDecision {
        if !auth.is_initialized {
            return GuardDecision::Pending;
        }
        if !auth.is_authenticated() {
            return GuardDecision::Redirect {
                location: self.login_location(),
            };
        }
        if self.required.is_empty() {
            return GuardDecision::Render;
        }
        if permissions.loading || permissions.settled_for != auth.user_id() {
            return GuardDecision::Pending;
        }
        if permissions.set.has_all(self.required.as_slice()) {
            GuardDecision::Render
        } else {
            GuardDecision::Denied {
                missing: permissions.set.missing(self.required.as_slice()),
            }
        }
    }

    /// Wait until the decision is final.
    ///
    /// If either channel closes while the decision is still pending, the
    /// visitor is treated as unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns [`GuardRejection`] when the visitor must be redirected or denied.
    pub async fn admit(
        &self,
        auth: &mut watch::Receiver<AuthState>,
        permissions: &mut watch::Receiver<PermissionSnapshot>,
    ) -> Result<(), GuardRejection> {
        loop {
            let decision = {
                let auth_state = auth.borrow_and_update();
                let snapshot = permissions.borrow_and_update();
                self.evaluate(&auth_state, &snapshot)
            };

            match decision {
                GuardDecision::Render => return Ok(()),
                GuardDecision::Redirect { location } => {
                    return Err(GuardRejection::Unauthenticated { location });
                }
                GuardDecision::Denied { missing } => {
                    return Err(GuardRejection::Forbidden { missing });
                }
                GuardDecision::Pending => {}
            }

            let closed = tokio::select! {
                changed = auth.changed() => changed.is_err(),
                changed = permissions.changed() => changed.is_err(),
            };
            if closed {
                tracing::debug!("Session channel closed while guard was pending");
                return Err(GuardRejection::Unauthenticated {
                    location: self.login_location(),
                });
            }
        }
    }

    fn login_location(&self) -> String {
        match &self.path {
            Some(path) => format!("{}?next={}", self.login_path, urlencoding::encode(path)),
            None => self.login_path.clone(),
        }
    }
}

#[cfg(feature = "axum")]
mod response {
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Redirect, Response};

    use super::GuardRejection;

    impl IntoResponse for GuardRejection {
        fn into_response(self) -> Response {
            match self {
                Self::Unauthenticated { location } => Redirect::to(&location).into_response(),
                Self::Forbidden { ref missing } => {
                    tracing::info!(missing = ?missing, "Access denied");
                    (StatusCode::FORBIDDEN, "Access denied").into_response()
                }
            }
        }
    }
}
