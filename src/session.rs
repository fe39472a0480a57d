//! Session and state storage.
//!
//! A session is keyed by (application, user, session) and holds the ordered
//! event history plus a flat key → value state map. Keys prefixed with
//! `app:` are shared by every session of the application, `user:` keys by
//! every session of one user, and `temp:` keys only live for a single run.

use crate::error::WeftError;
use crate::types::*;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub app: String,
    pub user: String,
    pub session: String,
}

impl SessionKey {
    pub fn new(
        app: impl Into<String>,
        user: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            user: user.into(),
            session: session.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub state: StateMap,
    pub events: Vec<Event>,
    pub last_update: u64,
    /// `state` as handed out by the service.
    #[serde(skip)]
    loaded_state: StateMap,
}

impl Session {
    pub fn new(key: SessionKey, state: StateMap) -> Self {
        Self {
            key,
            state,
            events: Vec::new(),
            last_update: now_ms(),
            loaded_state: StateMap::new(),
        }
    }

    /// Record the current state as what was loaded. Services call this on
    /// every session they return, so a later save can tell what changed.
    pub fn mark_loaded(mut self) -> Self {
        self.loaded_state = self.state.clone();
        self
    }

    /// Keys whose value differs from the loaded state, in key order.
    /// Removed keys map to `None`.
    pub fn state_changes(&self) -> Vec<(&str, Option<&serde_json::Value>)> {
        let mut changes: Vec<(&str, Option<&serde_json::Value>)> = self
            .state
            .iter()
            .filter(|(k, v)| self.loaded_state.get(k.as_str()) != Some(*v))
            .map(|(k, v)| (k.as_str(), Some(v)))
            .collect();
        changes.extend(
            self.loaded_state
                .keys()
                .filter(|k| !self.state.contains_key(k.as_str()))
                .map(|k| (k.as_str(), None)),
        );
        changes.sort_by(|a, b| a.0.cmp(b.0));
        changes
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The state map of one in-flight run.
///
/// All writers go through one mapping-level lock, which is what keeps
/// concurrent children of a parallel composition from losing writes.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<StateMap>>,
}

impl SharedState {
    pub fn new(initial: StateMap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().remove(key)
    }

    /// Read-modify-write under the lock.
    pub fn update(
        &self,
        key: &str,
        f: impl FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    ) -> serde_json::Value {
        let mut map = self.lock();
        let next = f(map.get(key));
        map.insert(key.to_string(), next.clone());
        next
    }

    pub fn snapshot(&self) -> StateMap {
        self.lock().clone()
    }
}

/// A view of [`SharedState`] that records every write it makes, so the
/// step that made them can report a `state_delta`.
#[derive(Debug, Clone)]
pub struct State {
    shared: SharedState,
    delta: Arc<Mutex<StateMap>>,
}

impl State {
    pub fn new(shared: SharedState) -> Self {
        Self {
            shared,
            delta: Arc::new(Mutex::new(StateMap::new())),
        }
    }

    fn record(&self, key: &str, value: serde_json::Value) {
        self.delta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.shared.get(key)
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        let key = key.into();
        let value = value.into();
        self.shared.set(key.clone(), value.clone());
        self.record(&key, value);
    }

    pub fn update(
        &self,
        key: &str,
        f: impl FnOnce(Option<&serde_json::Value>) -> serde_json::Value,
    ) -> serde_json::Value {
        let next = self.shared.update(key, f);
        self.record(key, next.clone());
        next
    }

    /// Removals show up in the delta as `null`.
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let old = self.shared.remove(key);
        if old.is_some() {
            self.record(key, serde_json::Value::Null);
        }
        old
    }

    pub fn to_map(&self) -> StateMap {
        self.shared.snapshot()
    }

    pub fn take_delta(&self) -> StateMap {
        std::mem::take(&mut *self.delta.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

// ---------------------------------------------------------------------------
// Session service
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionService: Send + Sync {
    /// Create a session; fails if one already exists under `key`.
    async fn create(&self, key: &SessionKey, state: StateMap) -> Result<Session, WeftError>;

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, WeftError>;

    async fn get_or_create(&self, key: &SessionKey) -> Result<Session, WeftError> {
        match self.get(key).await? {
            Some(session) => Ok(session),
            None => self.create(key, StateMap::new()).await,
        }
    }

    async fn save(&self, session: &Session) -> Result<(), WeftError>;

    async fn delete(&self, key: &SessionKey) -> Result<(), WeftError>;

    async fn list(&self, app: &str, user: &str) -> Result<Vec<SessionKey>, WeftError>;
}

#[derive(Default)]
struct Store {
    sessions: HashMap<SessionKey, Session>,
    app_state: HashMap<String, StateMap>,
    user_state: HashMap<(String, String), StateMap>,
}

/// Which store a state key lives in, by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    App,
    User,
    Session,
    Temp,
}

fn scope_of(key: &str) -> Scope {
    if key.starts_with(TEMP_PREFIX) {
        Scope::Temp
    } else if key.starts_with(APP_PREFIX) {
        Scope::App
    } else if key.starts_with(USER_PREFIX) {
        Scope::User
    } else {
        Scope::Session
    }
}

impl Store {
    /// Session-scoped state overlaid with the app and user scopes.
    fn merged(&self, session: &Session) -> Session {
        let mut merged = session.clone();
        if let Some(app) = self.app_state.get(&session.key.app) {
            merged.state.extend(app.clone());
        }
        let user_key = (session.key.app.clone(), session.key.user.clone());
        if let Some(user) = self.user_state.get(&user_key) {
            merged.state.extend(user.clone());
        }
        merged.mark_loaded()
    }

    fn scope_map(&mut self, key: &SessionKey, scope: Scope) -> Option<&mut StateMap> {
        match scope {
            Scope::App => Some(self.app_state.entry(key.app.clone()).or_default()),
            Scope::User => Some(
                self.user_state
                    .entry((key.app.clone(), key.user.clone()))
                    .or_default(),
            ),
            Scope::Session | Scope::Temp => None,
        }
    }

    /// Write one shared-scope change; `None` removes the key.
    fn apply(&mut self, key: &SessionKey, name: &str, value: Option<&serde_json::Value>) {
        let Some(map) = self.scope_map(key, scope_of(name)) else {
            return;
        };
        match value {
            Some(v) => {
                map.insert(name.to_string(), v.clone());
            }
            None => {
                map.remove(name);
            }
        }
    }
}

/// The keys of `state` that belong to the session itself.
fn own_state(state: &StateMap) -> StateMap {
    state
        .iter()
        .filter(|(k, _)| scope_of(k) == Scope::Session)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory session storage for tests and local development.
#[derive(Default)]
pub struct InMemorySessionService {
    store: RwLock<Store>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn create(&self, key: &SessionKey, state: StateMap) -> Result<Session, WeftError> {
        let mut store = self.store.write().await;
        if store.sessions.contains_key(key) {
            return Err(WeftError::duplicate("session", &key.session));
        }
        for (name, value) in &state {
            store.apply(key, name, Some(value));
        }
        let session = Session::new(key.clone(), own_state(&state));
        store.sessions.insert(key.clone(), session.clone());
        Ok(store.merged(&session))
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, WeftError> {
        let store = self.store.read().await;
        Ok(store.sessions.get(key).map(|s| store.merged(s)))
    }

    async fn save(&self, session: &Session) -> Result<(), WeftError> {
        let mut store = self.store.write().await;
        // Shared scopes only take what this session changed, so a stale
        // copy does not undo another session's writes.
        for (name, value) in session.state_changes() {
            store.apply(&session.key, name, value);
        }
        let mut stored = Session::new(session.key.clone(), own_state(&session.state));
        stored.events = session.events.iter().filter(|e| !e.partial).cloned().collect();
        store.sessions.insert(session.key.clone(), stored);
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<(), WeftError> {
        let mut store = self.store.write().await;
        store
            .sessions
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| WeftError::not_found("session", &key.session))
    }

    async fn list(&self, app: &str, user: &str) -> Result<Vec<SessionKey>, WeftError> {
        let store = self.store.read().await;
        let mut keys: Vec<SessionKey> = store
            .sessions
            .keys()
            .filter(|k| k.app == app && k.user == user)
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
