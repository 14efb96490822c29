//! In-memory backend and notifier shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Error;
use crate::notify::{Notice, Notifier};
use crate::storage::Storage;
use crate::traits::{AuthBackend, PermissionBackend, ProfileBackend};
use crate::types::{
    AuthToken, Credentials, GroupedPermissions, LoginResponse, PasswordChange, Permission,
    ProfileUpdate, UserSummary,
};

#[derive(Clone)]
pub(crate) enum Reply<T> {
    Ok(T),
    Status(u16),
}

impl<T: Clone> Reply<T> {
    fn resolve(&self, operation: &'static str) -> Result<T, Error> {
        match self {
            Self::Ok(value) => Ok(value.clone()),
            Self::Status(status) => Err(Error::Api {
                operation,
                status: *status,
                detail: String::new(),
            }),
        }
    }
}

pub(crate) struct FakeBackend {
    pub login: Mutex<Reply<LoginResponse>>,
    pub validate: Mutex<Reply<UserSummary>>,
    pub permissions: Mutex<Reply<GroupedPermissions>>,
    pub profile: Mutex<Reply<UserSummary>>,
    pub password: Mutex<Reply<()>>,
    pub login_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub permission_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Notify>>>,
    permission_holds: Mutex<VecDeque<Arc<Notify>>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            login: Mutex::new(Reply::Status(400)),
            validate: Mutex::new(Reply::Status(401)),
            permissions: Mutex::new(Reply::Ok(GroupedPermissions::default())),
            profile: Mutex::new(Reply::Status(404)),
            password: Mutex::new(Reply::Ok(())),
            login_calls: AtomicUsize::new(0),
            validate_calls: AtomicUsize::new(0),
            permission_calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
            permission_holds: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_login(self, reply: Reply<LoginResponse>) -> Self {
        *self.login.lock() = reply;
        self
    }

    pub fn with_validate(self, reply: Reply<UserSummary>) -> Self {
        *self.validate.lock() = reply;
        self
    }

    pub fn with_permissions(self, reply: Reply<GroupedPermissions>) -> Self {
        *self.permissions.lock() = reply;
        self
    }

    pub fn with_profile(self, reply: Reply<UserSummary>) -> Self {
        *self.profile.lock() = reply;
        self
    }

    /// Hold login, validation and permission replies until the returned handle is notified.
    pub fn gated(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some(notify.clone());
        notify
    }

    /// Hold only the next permission fetch. The reply is chosen when the
    /// fetch starts.
    pub fn hold_next_permissions(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.permission_holds.lock().push_back(notify.clone());
        notify
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl AuthBackend for FakeBackend {
    async fn login(&self, _credentials: &Credentials) -> Result<LoginResponse, Error> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_gate().await;
        let reply = self.login.lock().clone();
        reply.resolve("login")
    }

    async fn validate_token(&self, _token: &AuthToken) -> Result<UserSummary, Error> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_gate().await;
        let reply = self.validate.lock().clone();
        reply.resolve("token validation")
    }
}

impl PermissionBackend for FakeBackend {
    async fn my_permissions(&self, _token: &AuthToken) -> Result<GroupedPermissions, Error> {
        self.permission_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.permissions.lock().clone();
        let hold = self.permission_holds.lock().pop_front();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        self.wait_gate().await;
        reply.resolve("permission fetch")
    }
}

impl ProfileBackend for FakeBackend {
    async fn me(&self, _token: &AuthToken) -> Result<UserSummary, Error> {
        let reply = self.profile.lock().clone();
        reply.resolve("profile fetch")
    }

    async fn update_me(
        &self,
        _token: &AuthToken,
        _update: &ProfileUpdate,
    ) -> Result<UserSummary, Error> {
        let reply = self.profile.lock().clone();
        reply.resolve("profile update")
    }

    async fn change_password(
        &self,
        _token: &AuthToken,
        _change: &PasswordChange,
    ) -> Result<(), Error> {
        let reply = self.password.lock().clone();
        reply.resolve("password change")
    }
}

pub(crate) fn grouped(category: &str, codenames: &[&str]) -> GroupedPermissions {
    let mut grouped = GroupedPermissions::default();
    grouped.permissions_by_category.insert(
        category.to_owned(),
        codenames.iter().map(|c| Permission::new(*c)).collect(),
    );
    grouped
}

#[derive(Default)]
pub(crate) struct CollectingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

/// Storage whose writes always fail.
pub(crate) struct ReadOnlyStorage;

impl Storage for ReadOnlyStorage {
    fn get_item(&self, _key: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }

    fn set_item(&self, _key: &str, _value: &str) -> Result<(), Error> {
        Err(Error::Storage("quota exceeded".into()))
    }

    fn remove_item(&self, _key: &str) -> Result<(), Error> {
        Ok(())
    }
}
