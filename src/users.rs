//! User directory lookup, for author-name autocompletion.
//!
//! The service does not know or care where users come from; authors are
//! stored as plain attribution records. The directory is only a
//! convenience for looking up names, never authentication. Site-specific
//! backends (LDAP, the OS password database) implement [`Directory`];
//! the built-in implementation serves a static list from configuration.

use serde::Deserialize;

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct User {
    pub login: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A user directory backend.
pub trait Directory: Send + Sync {
    /// Users whose login or full name matches the search string. An empty
    /// search returns nothing.
    fn search(&self, query: &str) -> Vec<User>;
}

/// Directory backed by a fixed list from the configuration file.
pub struct StaticDirectory {
    users: Vec<User>,
    max_results: usize,
}

impl StaticDirectory {
    pub fn new(users: Vec<User>) -> Self {
        Self {
            users,
            max_results: 20,
        }
    }
}

impl Directory for StaticDirectory {
    fn search(&self, query: &str) -> Vec<User> {
        if query.is_empty() {
            return Vec::new();
        }
        let query = query.to_lowercase();
        self.users
            .iter()
            .filter(|u| {
                u.login.to_lowercase().starts_with(&query)
                    || u.name.to_lowercase().contains(&query)
            })
            .take(self.max_results)
            .cloned()
            .collect()
    }
}
