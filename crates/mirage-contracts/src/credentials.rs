use std::env;
use std::sync::{Arc, Mutex};

/// Session-scoped holder for the user-supplied provider API key.
///
/// One value, last-write-wins, alive only for the process lifetime. The
/// settings surface writes it, the dispatcher reads it. Cloning shares the
/// underlying slot.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key; blank input clears it, matching the settings surface
    /// where saving an empty field removes the stored key.
    pub fn set(&self, value: &str) {
        let trimmed = value.trim();
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
    }

    pub fn clear(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    pub fn current(&self) -> Option<String> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Resolves the credential a generation request should carry: the session
/// value when present, otherwise the process-level default.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    store: CredentialStore,
    default_key: Option<String>,
}

impl CredentialResolver {
    /// Default chain mirrors the provider conventions the engine accepts.
    pub fn new(store: CredentialStore) -> Self {
        let default_key = non_empty_env("MIRAGE_API_KEY")
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
            .or_else(|| non_empty_env("GOOGLE_API_KEY"));
        Self { store, default_key }
    }

    /// Injectable default for tests and embedders that resolve config
    /// themselves.
    pub fn with_default(store: CredentialStore, default_key: Option<String>) -> Self {
        let default_key = default_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Self { store, default_key }
    }

    pub fn resolve(&self) -> Option<String> {
        self.store.current().or_else(|| self.default_key.clone())
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }
}

/// Redact a key for logs and event payloads: first and last four characters
/// with the middle elided; short values are hidden entirely.
pub fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "[HIDDEN]".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
