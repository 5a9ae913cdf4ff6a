//! Recipient directory: resolves a user id to the contact attribute each
//! channel needs.
//!
//! Senders receive the directory explicitly at construction, so tests and
//! deployments can substitute their own.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve_email(&self, user_id: i64) -> Option<String>;
    async fn resolve_phone(&self, user_id: i64) -> Option<String>;
    async fn resolve_display_name(&self, user_id: i64) -> Option<String>;
}

/// Contact attributes known for one user. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecipientEntry {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub display_name: Option<String>,
}

impl RecipientEntry {
    pub fn new(email: Option<&str>, phone: Option<&str>, display_name: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            display_name: display_name.map(str::to_string),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    users: HashMap<i64, RecipientEntry>,
}

/// Fixed, in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<i64, RecipientEntry>,
}

impl StaticDirectory {
    pub fn new(entries: HashMap<i64, RecipientEntry>) -> Self {
        Self { entries }
    }

    /// Built-in directory used when no file is configured. User 3 has no
    /// email address on purpose.
    pub fn seeded() -> Self {
        let entries = HashMap::from([
            (
                1,
                RecipientEntry::new(Some("test1@example.com"), Some("+911111111111"), Some("Alice")),
            ),
            (
                2,
                RecipientEntry::new(Some("test2@example.com"), Some("+922222222222"), Some("Bob")),
            ),
            (3, RecipientEntry::new(None, Some("+933333333333"), Some("Charlie"))),
        ]);
        Self::new(entries)
    }

    /// Parse a directory from JSON of the form
    /// `{"users": {"1": {"email": "...", "phone": "...", "display_name": "..."}}}`.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: DirectoryFile = serde_json::from_str(json)?;
        Ok(Self::new(file.users))
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read directory file {}: {}", path.display(), e))?;
        let directory = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            users = directory.entries.len(),
            "Loaded recipient directory"
        );
        Ok(directory)
    }

    fn entry(&self, user_id: i64) -> Option<&RecipientEntry> {
        self.entries.get(&user_id)
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn resolve_email(&self, user_id: i64) -> Option<String> {
        self.entry(user_id).and_then(|e| e.email.clone())
    }

    async fn resolve_phone(&self, user_id: i64) -> Option<String> {
        self.entry(user_id).and_then(|e| e.phone.clone())
    }

    async fn resolve_display_name(&self, user_id: i64) -> Option<String> {
        self.entry(user_id).and_then(|e| e.display_name.clone())
    }
}
