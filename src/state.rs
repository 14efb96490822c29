//! Session state and the pure transition function over it.

use crate::types::{AuthToken, UserSummary};

/// Client-side session.
///
/// There is no stored "authenticated" flag: [`is_authenticated`] is derived
/// from token presence so the two can never disagree.
///
/// [`is_authenticated`]: AuthState::is_authenticated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub token: Option<AuthToken>,
    pub user: Option<UserSummary>,
    pub is_loading: bool,
    pub is_initialized: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Uninitialized,
    Initializing,
    Authenticated,
    Unauthenticated,
}

impl AuthState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        match (self.is_initialized, self.is_authenticated()) {
            (true, true) => AuthPhase::Authenticated,
            (true, false) => AuthPhase::Unauthenticated,
            (false, _) if self.is_loading => AuthPhase::Initializing,
            (false, _) => AuthPhase::Uninitialized,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<crate::types::UserId> {
        self.user.as_ref().map(|u| u.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthAction {
    /// A stored token was found and is being validated.
    Init,
    /// Initialization finished without a session.
    Ready,
    LoginRequest,
    LoginSuccess {
        token: AuthToken,
        user: UserSummary,
    },
    LoginFailure {
        error: String,
    },
    Logout,
    /// Fresh profile data for the signed-in user.
    UserUpdated(UserSummary),
}

/// Apply `action` to `state`.
#[must_use]
pub fn reduce(state: AuthState, action: AuthAction) -> AuthState {
    match action {
        AuthAction::Init => AuthState {
            is_loading: true,
            ..state
        },
        AuthAction::Ready => AuthState {
            is_initialized: true,
            ..AuthState::default()
        },
        AuthAction::LoginRequest => AuthState {
            is_loading: true,
            error: None,
            ..state
        },
        AuthAction::LoginSuccess { token, user } => AuthState {
            token: Some(token),
            user: Some(user),
            is_loading: false,
            is_initialized: true,
            error: None,
        },
        AuthAction::LoginFailure { error } => AuthState {
            error: Some(error),
            is_initialized: true,
            ..AuthState::default()
        },
        AuthAction::Logout => AuthState {
            is_initialized: true,
            ..AuthState::default()
        },
        AuthAction::UserUpdated(user) if state.user.is_some() => AuthState {
            user: Some(user),
            ..state
        },
        AuthAction::UserUpdated(_) => state,
    }
}
