use std::cell::OnceCell;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::args::Args;
use crate::registry::{HandlerNotFound, HandlerRegistry};
use crate::storage::{CallbackStorage, StorageError};

pub const CALLBACK_KEY_PREFIX: &str = "slack-bot-callback";
pub const CALLBACK_RECORD_EXPIRES_IN: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("callback not found")]
    NotFound,
    #[error("user is required for scoped callback")]
    UserRequired,
    #[error("callback has no attribute `{0}`")]
    NoSuchAttribute(String),
    #[error("stored callback is malformed: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The person a callback belongs to, as resolved by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            team_id: None,
            name: None,
        }
    }

    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }
}

/// Stored form of a callback; every field is optional so `{}` still loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CallbackData {
    #[serde(default)]
    class_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    view_id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    args: Args,
}

/// Handle over a storage backend plus the key and expiry settings callbacks
/// are written with.
#[derive(Clone)]
pub struct CallbackStore {
    storage: Arc<dyn CallbackStorage>,
    key_prefix: String,
    expires_in: Duration,
    user_scope: bool,
}

impl fmt::Debug for CallbackStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackStore")
            .field("key_prefix", &self.key_prefix)
            .field("expires_in", &self.expires_in)
            .field("user_scope", &self.user_scope)
            .finish_non_exhaustive()
    }
}

impl CallbackStore {
    pub fn new(storage: Arc<dyn CallbackStorage>) -> Self {
        Self {
            storage,
            key_prefix: CALLBACK_KEY_PREFIX.to_string(),
            expires_in: CALLBACK_RECORD_EXPIRES_IN,
            user_scope: true,
        }
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    /// `false` keys records by id alone instead of namespacing them per user.
    pub fn with_user_scope(mut self, user_scope: bool) -> Self {
        self.user_scope = user_scope;
        self
    }

    pub fn storage(&self) -> &Arc<dyn CallbackStorage> {
        &self.storage
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    /// Builds a transient callback; nothing is written until [`Callback::save`].
    pub fn build(&self, new: NewCallback) -> Callback {
        Callback {
            id: new.id.filter(|v| !is_blank(v)),
            data: CallbackData {
                class_name: new.class_name,
                user_id: new.user.as_ref().map(|u| u.id.clone()),
                channel_id: new.channel_id,
                view_id: new.view_id,
                payload: new.payload,
                args: new.args,
            },
            expires_in: new.expires_in.unwrap_or(self.expires_in),
            user_scope: new.user_scope.unwrap_or(self.user_scope),
            user: match new.user {
                Some(user) => OnceCell::from(Some(user)),
                None => OnceCell::new(),
            },
            indexed_view_id: None,
            store: self.clone(),
        }
    }

    /// Loads a callback; blank ids, missing and expired records are all `None`.
    pub fn find(&self, id: &str, user: Option<&Principal>) -> Result<Option<Callback>, CallbackError> {
        if is_blank(id) {
            return Ok(None);
        }
        let mut callback = self.build(NewCallback {
            id: Some(id.to_string()),
            user: user.cloned(),
            ..NewCallback::default()
        });
        match callback.reload() {
            Ok(()) => Ok(Some(callback)),
            Err(CallbackError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Resolves the view index entry to a callback id, then loads that callback.
    pub fn find_by_view_id(
        &self,
        view_id: &str,
        user: Option<&Principal>,
    ) -> Result<Option<Callback>, CallbackError> {
        let probe = self.build(NewCallback {
            view_id: Some(view_id.to_string()),
            user: user.cloned(),
            ..NewCallback::default()
        });
        match probe.read_view_callback_id()? {
            Some(callback_id) => self.find(&callback_id, user),
            None => Ok(None),
        }
    }

    pub fn create(&self, new: NewCallback) -> Result<Callback, CallbackError> {
        let mut callback = self.build(new);
        callback.save()?;
        Ok(callback)
    }

    pub fn find_or_create(&self, new: NewCallback) -> Result<Callback, CallbackError> {
        if let Some(id) = new.id.as_deref() {
            if let Some(existing) = self.find(id, new.user.as_ref())? {
                return Ok(existing);
            }
        }
        self.create(new)
    }
}

/// Construction parameters for a callback.
#[derive(Debug, Clone, Default)]
pub struct NewCallback {
    pub id: Option<String>,
    pub class_name: Option<String>,
    pub user: Option<Principal>,
    pub channel_id: Option<String>,
    pub view_id: Option<String>,
    pub payload: Option<Value>,
    pub args: Args,
    pub expires_in: Option<Duration>,
    pub user_scope: Option<bool>,
}

impl NewCallback {
    pub fn new(class_name: impl Into<String>, user: Principal) -> Self {
        Self {
            class_name: Some(class_name.into()),
            user: Some(user),
            ..Self::default()
        }
    }

    /// Ids share the key space of view ids under the same user, so an id
    /// must never equal a Slack view id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_view_id(mut self, view_id: impl Into<String>) -> Self {
        self.view_id = Some(view_id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = args;
        self
    }

    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn unscoped(mut self) -> Self {
        self.user_scope = Some(false);
        self
    }
}

/// Correlates a Slack callback with the handler, user and state that started it.
#[derive(Clone)]
pub struct Callback {
    id: Option<String>,
    data: CallbackData,
    expires_in: Duration,
    user_scope: bool,
    user: OnceCell<Option<Principal>>,
    /// View id the index was last written for, if any.
    indexed_view_id: Option<String>,
    store: CallbackStore,
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("expires_in", &self.expires_in)
            .field("user_scope", &self.user_scope)
            .finish_non_exhaustive()
    }
}

impl Callback {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn class_name(&self) -> Option<&str> {
        self.data.class_name.as_deref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.user_id.as_deref()
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.data.channel_id.as_deref()
    }

    pub fn view_id(&self) -> Option<&str> {
        self.data.view_id.as_deref()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.data.payload.as_ref()
    }

    pub fn args(&self) -> &Args {
        &self.data.args
    }

    pub fn args_mut(&mut self) -> &mut Args {
        &mut self.data.args
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_in
    }

    pub fn user_scope(&self) -> bool {
        self.user_scope
    }

    pub fn set_id(&mut self, id: Option<String>) {
        self.id = id.filter(|v| !is_blank(v));
    }

    pub fn set_class_name(&mut self, class_name: Option<String>) {
        self.data.class_name = class_name;
    }

    pub fn set_channel_id(&mut self, channel_id: Option<String>) {
        self.data.channel_id = channel_id;
    }

    pub fn set_view_id(&mut self, view_id: Option<String>) {
        self.data.view_id = view_id;
    }

    pub fn set_payload(&mut self, payload: Option<Value>) {
        self.data.payload = payload;
    }

    pub fn set_args(&mut self, args: Args) {
        self.data.args = args;
    }

    pub fn set_expires_in(&mut self, expires_in: Duration) {
        self.expires_in = expires_in;
    }

    pub fn set_user(&mut self, user: Option<Principal>) {
        self.data.user_id = user.as_ref().map(|u| u.id.clone());
        self.user = OnceCell::from(user);
    }

    /// Resolves the owner through `finder` on first call and memoizes it.
    /// `finder` is never called when the record has no user id.
    pub fn user<F>(&self, finder: F) -> Option<&Principal>
    where
        F: FnOnce(&str) -> Option<Principal>,
    {
        self.user
            .get_or_init(|| {
                self.data
                    .user_id
                    .as_deref()
                    .filter(|v| !is_blank(v))
                    .and_then(finder)
            })
            .as_ref()
    }

    /// `Ok(None)` when no handler name is recorded.
    pub fn handler<H: ?Sized>(
        &self,
        registry: &HandlerRegistry<H>,
    ) -> Result<Option<Arc<H>>, HandlerNotFound> {
        match self.class_name().filter(|v| !is_blank(v)) {
            Some(name) => registry.find(name).map(Some),
            None => Ok(None),
        }
    }

    /// Points the record at another registered handler; unknown names are rejected.
    pub fn set_handler<H: ?Sized>(
        &mut self,
        registry: &HandlerRegistry<H>,
        name: Option<&str>,
    ) -> Result<(), HandlerNotFound> {
        if let Some(name) = name {
            registry.find(name)?;
        }
        self.data.class_name = name.map(|v| v.to_string());
        Ok(())
    }

    /// Uniform field lookup: record fields first, then keys of an object payload.
    /// A present field holding null is `Ok(Value::Null)`.
    pub fn get(&self, name: &str) -> Result<Value, CallbackError> {
        let field = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        match name {
            "id" => Ok(field(&self.id)),
            "class_name" => Ok(field(&self.data.class_name)),
            "user_id" => Ok(field(&self.data.user_id)),
            "channel_id" => Ok(field(&self.data.channel_id)),
            "view_id" => Ok(field(&self.data.view_id)),
            "payload" => Ok(self.data.payload.clone().unwrap_or(Value::Null)),
            "args" => Ok(Value::String(self.data.args.encode())),
            _ => self
                .data
                .payload
                .as_ref()
                .and_then(|p| p.as_object())
                .and_then(|p| p.get(name))
                .cloned()
                .ok_or_else(|| CallbackError::NoSuchAttribute(name.to_string())),
        }
    }

    /// Replaces in-memory state with the stored record.
    pub fn reload(&mut self) -> Result<(), CallbackError> {
        let key = self.storage_key()?;
        let stored = self.store.storage.read(&key)?;
        debug!(key = %key, found = stored.is_some(), "callback read");
        let stored = stored.ok_or(CallbackError::NotFound)?;
        if !stored.is_object() {
            return Err(CallbackError::Malformed(format!(
                "expected an object under {key}"
            )));
        }
        self.data =
            serde_json::from_value(stored).map_err(|e| CallbackError::Malformed(e.to_string()))?;
        self.indexed_view_id = self.view_id().filter(|v| !is_blank(v)).map(|v| v.to_string());
        Ok(())
    }

    /// Writes the record (and its view index entry) and re-arms the expiry.
    /// An index entry left behind by a previous view id is removed.
    pub fn save(&mut self) -> Result<(), CallbackError> {
        if self.id.is_none() {
            self.id = Some(generate_id());
        }
        let key = self.storage_key()?;
        let view_key = match self.view_id() {
            Some(view_id) if !is_blank(view_id) => Some(self.scoped_key(view_id)?),
            _ => None,
        };
        let value = serde_json::to_value(&self.data)
            .map_err(|e| CallbackError::Malformed(e.to_string()))?;
        let storage = &self.store.storage;

        if let (Some(view_key), Some(id)) = (view_key.as_deref(), self.id.as_deref()) {
            storage.write(view_key, &Value::String(id.to_string()), self.expires_in)?;
        }
        storage.write(&key, &value, self.expires_in)?;
        debug!(key = %key, expires_in_secs = self.expires_in.as_secs(), "callback written");

        let current = self.view_id().filter(|v| !is_blank(v)).map(|v| v.to_string());
        if let Some(previous) = self.indexed_view_id.take().filter(|v| Some(v) != current.as_ref()) {
            let stale_key = self.scoped_key(&previous)?;
            self.store.storage.delete(&stale_key)?;
            debug!(key = %stale_key, "stale view index deleted");
        }
        self.indexed_view_id = current;
        Ok(())
    }

    /// Merges `payload` into the stored payload and saves. Returns `false`
    /// without writing when the record was never saved.
    ///
    /// Two updates racing on the same id are not serialized: each saves its
    /// whole in-memory copy and the later write wins.
    pub fn update(&mut self, payload: Value) -> Result<bool, CallbackError> {
        if self.id.is_none() {
            return Ok(false);
        }
        self.data.payload = Some(match (self.data.payload.take(), payload) {
            (Some(Value::Object(mut existing)), Value::Object(incoming)) => {
                existing.extend(incoming);
                Value::Object(existing)
            }
            (_, incoming) => incoming,
        });
        self.save()?;
        Ok(true)
    }

    /// Removes the record and its view index entry. Returns `false` when
    /// there was no id to delete.
    pub fn destroy(&self) -> Result<bool, CallbackError> {
        if self.id.is_none() {
            return Ok(false);
        }
        let key = self.storage_key()?;
        if let Some(view_id) = self.view_id().filter(|v| !is_blank(v)) {
            self.store.storage.delete(&self.scoped_key(view_id)?)?;
        }
        if let Some(indexed) = self
            .indexed_view_id
            .as_deref()
            .filter(|v| Some(*v) != self.view_id())
        {
            self.store.storage.delete(&self.scoped_key(indexed)?)?;
        }
        self.store.storage.delete(&key)?;
        debug!(key = %key, "callback deleted");
        Ok(true)
    }

    /// Reads the callback id the view index points at.
    pub fn read_view_callback_id(&self) -> Result<Option<String>, CallbackError> {
        let view_id = match self.view_id().filter(|v| !is_blank(v)) {
            Some(v) => v,
            None => return Ok(None),
        };
        let stored = self.store.storage.read(&self.scoped_key(view_id)?)?;
        Ok(stored
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .filter(|v| !is_blank(v)))
    }

    pub fn storage_key(&self) -> Result<String, CallbackError> {
        self.scoped_key(self.id.as_deref().unwrap_or_default())
    }

    pub fn view_storage_key(&self) -> Result<String, CallbackError> {
        self.scoped_key(self.view_id().unwrap_or_default())
    }

    fn scoped_key(&self, suffix: &str) -> Result<String, CallbackError> {
        let prefix = &self.store.key_prefix;
        if !self.user_scope {
            return Ok(format!("{prefix}:{suffix}"));
        }
        let user_id = self
            .user_id()
            .filter(|v| !is_blank(v))
            .ok_or(CallbackError::UserRequired)?;
        Ok(format!("{prefix}:u{user_id}:{suffix}"))
    }
}

fn generate_id() -> String {
    let bytes: [u8; 10] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::cell::Cell;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStorage {
        inner: MemoryStorage,
        writes: Mutex<Vec<(String, Value, Duration)>>,
        deletes: Mutex<Vec<String>>,
    }

    impl CallbackStorage for RecordingStorage {
        fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &Value, expires_in: Duration) -> Result<(), StorageError> {
            self.writes
                .lock()
                .unwrap()
                .push((key.to_string(), value.clone(), expires_in));
            self.inner.write(key, value, expires_in)
        }

        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.deletes.lock().unwrap().push(key.to_string());
            self.inner.delete(key)
        }
    }

    fn recording_store() -> (Arc<RecordingStorage>, CallbackStore) {
        let storage = Arc::new(RecordingStorage::default());
        let store = CallbackStore::new(storage.clone());
        (storage, store)
    }

    fn user(id: &str) -> Principal {
        Principal::new(id)
    }

    #[test]
    fn find_returns_none_for_blank_or_missing_ids() {
        let (_, store) = recording_store();
        assert!(store.find("", Some(&user("1"))).unwrap().is_none());
        assert!(store.find("   ", Some(&user("1"))).unwrap().is_none());
        assert!(store.find("missing", Some(&user("1"))).unwrap().is_none());
    }

    #[test]
    fn find_reconstructs_record_and_args() {
        let (storage, store) = recording_store();
        storage
            .inner
            .write(
                "slack-bot-callback:u1:cb1",
                &json!({
                    "class_name": "Test",
                    "user_id": "1",
                    "channel_id": "C1",
                    "payload": {"test": "test"},
                    "args": "foo=bar"
                }),
                Duration::from_secs(60),
            )
            .unwrap();

        let found = store.find("cb1", Some(&user("1"))).unwrap().unwrap();
        assert_eq!(found.id(), Some("cb1"));
        assert_eq!(found.class_name(), Some("Test"));
        assert_eq!(found.channel_id(), Some("C1"));
        assert_eq!(found.payload(), Some(&json!({"test": "test"})));
        assert_eq!(found.args().get("foo"), Some("bar"));
    }

    #[test]
    fn empty_stored_object_is_still_a_live_record() {
        let (storage, store) = recording_store();
        storage
            .inner
            .write("slack-bot-callback:u1:cb1", &json!({}), Duration::from_secs(60))
            .unwrap();
        let found = store.find("cb1", Some(&user("1"))).unwrap().unwrap();
        assert!(found.args().is_empty());
        assert!(found.payload().is_none());
    }

    #[test]
    fn non_object_stored_value_is_malformed() {
        let (storage, store) = recording_store();
        storage
            .inner
            .write("slack-bot-callback:u1:cb1", &json!("oops"), Duration::from_secs(60))
            .unwrap();
        let err = store.find("cb1", Some(&user("1"))).unwrap_err();
        assert!(matches!(err, CallbackError::Malformed(_)));
    }

    #[test]
    fn reload_reports_not_found() {
        let (_, store) = recording_store();
        let mut callback = store.build(NewCallback::new("Test", user("1")).with_id("gone"));
        assert!(matches!(callback.reload(), Err(CallbackError::NotFound)));
    }

    #[test]
    fn create_assigns_hex_id_and_writes_default_expiry() {
        let (storage, store) = recording_store();
        let callback = store
            .create(
                NewCallback::new("Test", user("1"))
                    .with_channel_id("C1")
                    .with_payload(json!({"test": "test"})),
            )
            .unwrap();

        let id = callback.id().unwrap();
        assert_eq!(id.len(), 20);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let writes = storage.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        let (key, value, expires_in) = &writes[0];
        assert_eq!(key, &format!("slack-bot-callback:u1:{id}"));
        assert_eq!(*expires_in, CALLBACK_RECORD_EXPIRES_IN);
        assert_eq!(
            value,
            &json!({
                "class_name": "Test",
                "user_id": "1",
                "channel_id": "C1",
                "view_id": null,
                "payload": {"test": "test"},
                "args": ""
            })
        );
    }

    #[test]
    fn keys_are_namespaced_per_user() {
        let (_, store) = recording_store();
        let a = store.build(NewCallback::new("Test", user("1")).with_id("same"));
        let b = store.build(NewCallback::new("Test", user("2")).with_id("same"));
        assert_ne!(a.storage_key().unwrap(), b.storage_key().unwrap());
    }

    #[test]
    fn scoped_keys_require_a_user() {
        let (storage, store) = recording_store();
        let mut callback = store.build(NewCallback {
            class_name: Some("Test".to_string()),
            ..NewCallback::default()
        });
        assert!(matches!(callback.save(), Err(CallbackError::UserRequired)));
        assert!(storage.writes.lock().unwrap().is_empty());
        assert!(matches!(
            store.find("cb1", None),
            Err(CallbackError::UserRequired)
        ));
    }

    #[test]
    fn unscoped_records_use_global_keys() {
        let (_, store) = recording_store();
        let store = store.with_user_scope(false);
        let callback = store
            .create(NewCallback {
                class_name: Some("Test".to_string()),
                ..NewCallback::default()
            })
            .unwrap();
        let id = callback.id().unwrap().to_string();
        assert_eq!(
            callback.storage_key().unwrap(),
            format!("slack-bot-callback:{id}")
        );
        assert!(store.find(&id, None).unwrap().is_some());
    }

    #[test]
    fn each_save_rearms_with_current_expiry() {
        let (storage, store) = recording_store();
        let mut callback = store
            .create(NewCallback::new("Test", user("1")).with_expires_in(Duration::from_secs(60)))
            .unwrap();
        callback.set_expires_in(Duration::from_secs(300));
        callback.save().unwrap();

        let writes = storage.writes.lock().unwrap();
        let expiries: Vec<Duration> = writes.iter().map(|(_, _, e)| *e).collect();
        assert_eq!(
            expiries,
            vec![Duration::from_secs(60), Duration::from_secs(300)]
        );
    }

    #[test]
    fn view_index_is_rearmed_with_the_record() {
        let (storage, store) = recording_store();
        let mut callback = store
            .create(
                NewCallback::new("Test", user("1"))
                    .with_view_id("V1")
                    .with_expires_in(Duration::from_secs(60)),
            )
            .unwrap();
        callback.set_expires_in(Duration::from_secs(300));
        callback.save().unwrap();

        let id = callback.id().unwrap().to_string();
        let record_key = format!("slack-bot-callback:u1:{id}");
        let writes: Vec<(String, Duration)> = storage
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(k, _, e)| (k.clone(), *e))
            .collect();
        assert_eq!(
            writes,
            vec![
                ("slack-bot-callback:u1:V1".to_string(), Duration::from_secs(60)),
                (record_key.clone(), Duration::from_secs(60)),
                ("slack-bot-callback:u1:V1".to_string(), Duration::from_secs(300)),
                (record_key, Duration::from_secs(300)),
            ]
        );
    }

    #[test]
    fn changing_view_id_drops_the_old_index_entry() {
        let (storage, store) = recording_store();
        let mut callback = store
            .create(NewCallback::new("Test", user("1")).with_view_id("V1"))
            .unwrap();
        let id = callback.id().unwrap().to_string();

        callback.set_view_id(Some("V2".to_string()));
        callback.save().unwrap();
        assert!(!storage.inner.contains_key("slack-bot-callback:u1:V1"));
        assert_eq!(
            store
                .find_by_view_id("V2", Some(&user("1")))
                .unwrap()
                .unwrap()
                .id(),
            Some(id.as_str())
        );

        let mut reloaded = store.find(&id, Some(&user("1"))).unwrap().unwrap();
        reloaded.set_view_id(Some("V3".to_string()));
        assert!(reloaded.destroy().unwrap());
        assert!(!storage.inner.contains_key("slack-bot-callback:u1:V2"));
        assert!(!storage.inner.contains_key(&format!("slack-bot-callback:u1:{id}")));
    }

    #[test]
    fn out_of_range_expiry_fails_instead_of_panicking() {
        let (_, store) = recording_store();
        let err = store
            .with_expires_in(Duration::from_secs(u64::MAX))
            .create(NewCallback::new("Test", user("1")))
            .unwrap_err();
        assert!(matches!(err, CallbackError::Storage(StorageError::Backend(_))));
    }

    #[test]
    fn view_index_points_back_at_the_record() {
        let (storage, store) = recording_store();
        let callback = store
            .create(NewCallback::new("Test", user("1")).with_view_id("V123"))
            .unwrap();
        let id = callback.id().unwrap().to_string();

        assert_eq!(
            storage.inner.read("slack-bot-callback:u1:V123").unwrap(),
            Some(Value::String(id.clone()))
        );
        let found = store
            .find_by_view_id("V123", Some(&user("1")))
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), Some(id.as_str()));

        assert!(callback.destroy().unwrap());
        assert!(!storage.inner.contains_key("slack-bot-callback:u1:V123"));
        assert!(!storage.inner.contains_key(&format!("slack-bot-callback:u1:{id}")));
        assert!(store
            .find_by_view_id("V123", Some(&user("1")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn find_by_view_id_without_index_is_none() {
        let (_, store) = recording_store();
        assert!(store
            .find_by_view_id("V404", Some(&user("1")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn destroy_without_id_is_a_no_op() {
        let (storage, store) = recording_store();
        let callback = store.build(NewCallback::new("Test", user("1")));
        assert!(!callback.destroy().unwrap());
        assert!(storage.deletes.lock().unwrap().is_empty());
    }

    #[test]
    fn update_merges_object_payloads() {
        let (_, store) = recording_store();
        let mut callback = store
            .create(NewCallback::new("Test", user("1")).with_payload(json!({"a": 1})))
            .unwrap();
        assert!(callback.update(json!({"b": 2})).unwrap());
        assert_eq!(callback.payload(), Some(&json!({"a": 1, "b": 2})));

        let reloaded = store
            .find(callback.id().unwrap(), Some(&user("1")))
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.payload(), Some(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn update_replaces_non_object_payloads() {
        let (_, store) = recording_store();
        let mut callback = store
            .create(NewCallback::new("Test", user("1")).with_payload(json!("not a map")))
            .unwrap();
        callback.update(json!({"b": 2})).unwrap();
        assert_eq!(callback.payload(), Some(&json!({"b": 2})));
    }

    #[test]
    fn update_before_first_save_writes_nothing() {
        let (storage, store) = recording_store();
        let mut callback = store.build(NewCallback::new("Test", user("1")));
        assert!(!callback.update(json!({"b": 2})).unwrap());
        assert!(storage.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_updates_last_writer_wins() {
        let (_, store) = recording_store();
        let created = store
            .create(NewCallback::new("Test", user("1")).with_payload(json!({"a": 1})))
            .unwrap();
        let id = created.id().unwrap().to_string();

        let mut first = store.find(&id, Some(&user("1"))).unwrap().unwrap();
        let mut second = store.find(&id, Some(&user("1"))).unwrap().unwrap();
        first.update(json!({"b": 2})).unwrap();
        second.update(json!({"c": 3})).unwrap();

        let stored = store.find(&id, Some(&user("1"))).unwrap().unwrap();
        assert_eq!(stored.payload(), Some(&json!({"a": 1, "c": 3})));
    }

    #[test]
    fn find_or_create_prefers_existing_record() {
        let (_, store) = recording_store();
        let existing = store
            .create(
                NewCallback::new("Test", user("1"))
                    .with_id("cb1")
                    .with_payload(json!({"kept": true})),
            )
            .unwrap();
        let found = store
            .find_or_create(
                NewCallback::new("Other", user("1"))
                    .with_id("cb1")
                    .with_payload(json!({"kept": false})),
            )
            .unwrap();
        assert_eq!(found.id(), existing.id());
        assert_eq!(found.class_name(), Some("Test"));

        let created = store
            .find_or_create(NewCallback::new("Other", user("1")).with_id("cb2"))
            .unwrap();
        assert_eq!(created.id(), Some("cb2"));
        assert_eq!(created.class_name(), Some("Other"));
    }

    #[test]
    fn save_round_trips_args() {
        let (_, store) = recording_store();
        let mut callback = store.create(NewCallback::new("Test", user("1"))).unwrap();
        callback.args_mut().set("page", "2");
        callback.save().unwrap();

        let found = store
            .find(callback.id().unwrap(), Some(&user("1")))
            .unwrap()
            .unwrap();
        assert_eq!(found.args().get("page"), Some("2"));
    }

    #[test]
    fn user_is_resolved_once_and_only_with_an_id() {
        let (_, store) = recording_store();
        let calls = Cell::new(0);
        let finder = |id: &str| {
            calls.set(calls.get() + 1);
            Some(Principal::new(id).with_team_id("T1"))
        };

        let mut callback = store.build(NewCallback::default());
        assert!(callback.user(finder).is_none());
        assert_eq!(calls.get(), 0);

        callback = store.build(NewCallback {
            id: Some("cb1".to_string()),
            ..NewCallback::default()
        });
        callback.data.user_id = Some("7".to_string());
        assert_eq!(callback.user(finder).unwrap().team_id.as_deref(), Some("T1"));
        assert_eq!(callback.user(finder).unwrap().id, "7");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn get_distinguishes_null_fields_from_unknown_ones() {
        let (_, store) = recording_store();
        let callback = store.build(
            NewCallback::new("Test", user("1")).with_payload(json!({"step": "confirm", "note": null})),
        );
        assert_eq!(callback.get("class_name").unwrap(), json!("Test"));
        assert_eq!(callback.get("channel_id").unwrap(), Value::Null);
        assert_eq!(callback.get("step").unwrap(), json!("confirm"));
        assert_eq!(callback.get("note").unwrap(), Value::Null);
        assert!(matches!(
            callback.get("nope"),
            Err(CallbackError::NoSuchAttribute(name)) if name == "nope"
        ));
    }

    #[test]
    fn handler_lookup_follows_class_name() {
        let mut registry: HandlerRegistry<str> = HandlerRegistry::new();
        registry.register("Test", Arc::from("test handler"));

        let (_, store) = recording_store();
        let mut callback = store.build(NewCallback::new("Test", user("1")));
        assert_eq!(
            callback.handler(&registry).unwrap().as_deref(),
            Some("test handler")
        );

        callback.set_class_name(None);
        assert!(callback.handler(&registry).unwrap().is_none());

        callback.set_class_name(Some("Renamed".to_string()));
        let err = callback.handler(&registry).unwrap_err();
        assert_eq!(err.name, "Renamed");
        assert_eq!(err.known, vec!["Test".to_string()]);

        assert!(callback.set_handler(&registry, Some("Ghost")).is_err());
        assert_eq!(callback.class_name(), Some("Renamed"));
        callback.set_handler(&registry, Some("Test")).unwrap();
        assert_eq!(callback.class_name(), Some("Test"));
    }

    #[test]
    fn expired_records_read_as_missing() {
        let (_, store) = recording_store();
        let callback = store
            .create(NewCallback::new("Test", user("1")).with_expires_in(Duration::ZERO))
            .unwrap();
        assert!(store
            .find(callback.id().unwrap(), Some(&user("1")))
            .unwrap()
            .is_none());
    }
}
