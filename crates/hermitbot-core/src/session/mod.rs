//! Conversation sessions and their file-based persistence.
//!
//! Each session is one JSON file named `<id>.json` in the data directory,
//! where `<id>` is a ULID. Sessions are created on first reference, keyed
//! in memory by their external key (`channel:sessionID`), and reaped by
//! age.

pub mod locker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::{DomainError, Sentinel};
use crate::provider::types::Message;

/// A conversation session.
///
/// All mutation goes through the internal read-write lock; `messages()`
/// returns a defensive copy.
pub struct Session {
    id: String,
    external_key: String,
    tenant_id: Option<String>,
    state: RwLock<SessionState>,
}

struct SessionState {
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// On-disk shape of a session.
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    id: String,
    external_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
    messages: Vec<Message>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(external_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            external_key: external_key.to_string(),
            tenant_id: None,
            state: RwLock::new(SessionState {
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
            }),
        }
    }

    pub fn with_tenant(external_key: &str, tenant_id: &str) -> Self {
        let mut session = Self::new(external_key);
        session.tenant_id = Some(tenant_id.to_string());
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn external_key(&self) -> &str {
        &self.external_key
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Defensive copy of the message history.
    pub fn messages(&self) -> Vec<Message> {
        self.state.read().unwrap().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&self, msg: Message) {
        let mut state = self.state.write().unwrap();
        state.messages.push(msg);
        touch(&mut state);
    }

    pub fn append_all(&self, msgs: impl IntoIterator<Item = Message>) {
        let mut state = self.state.write().unwrap();
        state.messages.extend(msgs);
        touch(&mut state);
    }

    /// Swap the entire history (compression rewrites go through here).
    pub fn replace_messages(&self, msgs: Vec<Message>) {
        let mut state = self.state.write().unwrap();
        state.messages = msgs;
        touch(&mut state);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.read().unwrap().created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.read().unwrap().updated_at
    }

    fn to_record(&self) -> SessionRecord {
        let state = self.state.read().unwrap();
        SessionRecord {
            id: self.id.clone(),
            external_key: self.external_key.clone(),
            tenant_id: self.tenant_id.clone(),
            messages: state.messages.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            external_key: record.external_key,
            tenant_id: record.tenant_id,
            state: RwLock::new(SessionState {
                messages: record.messages,
                created_at: record.created_at,
                // updated_at must never precede created_at, even for a
                // hand-edited file.
                updated_at: record.updated_at.max(record.created_at),
            }),
        }
    }
}

/// `updated_at` is monotonically non-decreasing.
fn touch(state: &mut SessionState) {
    state.updated_at = state.updated_at.max(Utc::now());
}

/// Manages sessions with one-JSON-file-per-session persistence.
pub struct SessionManager {
    data_dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    /// Create a manager rooted at `data_dir` (created `0700` if missing).
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Get the session for an external key, creating it on first reference.
    pub fn get_or_create(&self, external_key: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().unwrap().get(external_key) {
            return Arc::clone(session);
        }
        let mut map = self.sessions.write().unwrap();
        // Re-check under the write lock — another task may have won the race.
        if let Some(session) = map.get(external_key) {
            return Arc::clone(session);
        }
        let session = Arc::new(Session::new(external_key));
        debug!(key = external_key, id = session.id(), "Created session");
        map.insert(external_key.to_string(), Arc::clone(&session));
        session
    }

    pub fn get(&self, external_key: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(external_key).cloned()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// External keys of every session currently in memory.
    pub fn keys(&self) -> Vec<String> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }

    /// Persist one session to `<id>.json` (file mode `0600`).
    pub fn save(&self, session: &Session) -> Result<(), DomainError> {
        validate_session_id(session.id())?;
        let path = self.session_path(session.id());
        let json = serde_json::to_string_pretty(&session.to_record())
            .map_err(|e| DomainError::with_source("SessionManager.Save", Sentinel::InvalidInput, e))?;
        std::fs::write(&path, json)
            .map_err(|e| DomainError::with_source("SessionManager.Save", Sentinel::Provider, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Load every session file in the data directory into memory.
    ///
    /// Returns the number of sessions loaded. Unparseable files are
    /// skipped with a warning.
    pub fn load_all(&self) -> anyhow::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read session file");
                    continue;
                }
            };
            match serde_json::from_str::<SessionRecord>(&content) {
                Ok(record) => {
                    if validate_session_id(&record.id).is_err() {
                        warn!(path = %path.display(), "Skipping session with invalid id");
                        continue;
                    }
                    let session = Arc::new(Session::from_record(record));
                    self.sessions
                        .write()
                        .unwrap()
                        .insert(session.external_key().to_string(), session);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse session file");
                }
            }
        }
        Ok(loaded)
    }

    /// Drop a session from memory and disk.
    pub fn remove(&self, external_key: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(external_key);
        match removed {
            Some(session) => {
                let _ = std::fs::remove_file(self.session_path(session.id()));
                true
            }
            None => false,
        }
    }

    /// Remove every session whose `updated_at` is older than `max_age`.
    ///
    /// Returns the number of sessions reaped.
    pub fn reap_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<(String, String)> = {
            let map = self.sessions.read().unwrap();
            map.iter()
                .filter(|(_, s)| s.updated_at() < cutoff)
                .map(|(k, s)| (k.clone(), s.id().to_string()))
                .collect()
        };
        let mut map = self.sessions.write().unwrap();
        for (key, id) in &stale {
            map.remove(key);
            let _ = std::fs::remove_file(self.session_path(id));
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Reaped stale sessions");
        }
        stale.len()
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{id}.json"))
    }
}

/// Reject session ids that could escape the data directory.
pub fn validate_session_id(id: &str) -> Result<(), DomainError> {
    let bad = id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
        || id.contains("..")
        || Path::new(id).components().count() != 1;
    if bad {
        return Err(DomainError::new(
            "SessionManager.ValidateID",
            Sentinel::InvalidInput,
        ));
    }
    Ok(())
}
