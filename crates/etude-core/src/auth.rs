// src/auth.rs
//! Credential checks consulted by form logins and registrations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Account backend behind the `/login` and `/register` forms.
pub trait AuthService: Send + Sync {
    /// `true` when `user` exists and `password` matches.
    fn login(&self, user: &str, password: &str) -> bool;

    /// `true` when `user` did not exist and has now been created.
    fn register(&self, user: &str, password: &str) -> bool;
}

/// In-process user table.
#[derive(Default)]
pub struct MemoryAuth {
    users: Mutex<HashMap<String, String>>,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, U, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        let table = users
            .into_iter()
            .map(|(u, p)| (u.into(), p.into()))
            .collect();
        Self {
            users: Mutex::new(table),
        }
    }
}

impl AuthService for MemoryAuth {
    fn login(&self, user: &str, password: &str) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }
        debug!(user, "check login");
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        users.get(user).is_some_and(|stored| stored == password)
    }

    fn register(&self, user: &str, password: &str) -> bool {
        if user.is_empty() || password.is_empty() {
            return false;
        }
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(user) {
            return false;
        }
        debug!(user, "register");
        users.insert(user.to_string(), password.to_string());
        true
    }
}
