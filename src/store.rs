//! Persistent session state: token storage, ban record, ban gate
//!
//! The actual persistence is an injected collaborator behind the
//! [`SessionStore`] trait (a browser's localStorage, a file, ...). This
//! module only decides which keys hold what: the rotating session token
//! lives under a plain key, the ban record under base64-obfuscated keys with
//! base64-encoded values, matching what the upstream browser client writes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;

use crate::types::{now_millis, BanRecord};

/// Key holding the rotating session token.
pub const SESSION_TOKEN_KEY: &str = "JwtSession";

const BAN_END_KEY: &str = "STATEFULL_BAN";
const BAN_REASON_KEY: &str = "STATEFULL_BAN_REASON";

/// Abstract persistent key/value store for session state.
///
/// Implementations must tolerate concurrent readers; the client itself only
/// touches the store from the single active generation's control flow.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store, used in tests and as a default.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .remove(key);
    }
}

fn obfuscate(key: &str) -> String {
    BASE64.encode(key)
}

/// Typed view over the raw store: session token and ban record accessors.
#[derive(Clone)]
pub struct SessionStorage {
    store: Arc<dyn SessionStore>,
}

impl SessionStorage {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// The stored session token, if any. Empty tokens count as absent.
    pub fn session_token(&self) -> Option<String> {
        self.store
            .get(SESSION_TOKEN_KEY)
            .filter(|token| !token.is_empty())
    }

    pub fn set_session_token(&self, token: &str) {
        self.store.set(SESSION_TOKEN_KEY, token);
    }

    pub fn clear_session_token(&self) {
        self.store.remove(SESSION_TOKEN_KEY);
    }

    /// The persisted ban record, if one is readable.
    ///
    /// Corrupt or partially-written values are treated as no ban.
    pub fn ban_record(&self) -> Option<BanRecord> {
        let end_time = self
            .store
            .get(&obfuscate(BAN_END_KEY))
            .and_then(|value| BASE64.decode(value).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.trim().parse::<i64>().ok())?;
        let reason = self
            .store
            .get(&obfuscate(BAN_REASON_KEY))
            .and_then(|value| BASE64.decode(value).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default();
        Some(BanRecord { end_time, reason })
    }

    pub fn set_ban_record(&self, record: &BanRecord) {
        self.store.set(
            &obfuscate(BAN_END_KEY),
            &BASE64.encode(record.end_time.to_string()),
        );
        self.store
            .set(&obfuscate(BAN_REASON_KEY), &BASE64.encode(&record.reason));
    }

    pub fn clear_ban(&self) {
        self.store.remove(&obfuscate(BAN_END_KEY));
        self.store.remove(&obfuscate(BAN_REASON_KEY));
    }
}

/// Gate consulted before any network activity.
pub struct BanGate;

impl BanGate {
    /// Check the persisted ban record against the wall clock.
    pub fn check(storage: &SessionStorage) -> Option<i64> {
        Self::check_at(storage, now_millis())
    }

    /// `Some(-1)` for a permanent ban (never compared against the clock),
    /// `Some(end_time)` while the cooldown runs, `None` once expired; an
    /// expired record is cleared on the way out.
    pub fn check_at(storage: &SessionStorage, now_ms: i64) -> Option<i64> {
        let record = storage.ban_record()?;
        if record.is_permanent() {
            return Some(BanRecord::PERMANENT);
        }
        if record.end_time > now_ms {
            return Some(record.end_time);
        }
        debug!(end_time = record.end_time, "Persisted ban expired, clearing");
        storage.clear_ban();
        None
    }
}

/// Capability invoked after a ban is persisted, in place of the browser
/// client's page reload.
pub trait RestartSignal: Send + Sync {
    fn request_restart(&self);
}

/// Default restart signal that does nothing.
pub struct NoRestart;

impl RestartSignal for NoRestart {
    fn request_restart(&self) {}
}
