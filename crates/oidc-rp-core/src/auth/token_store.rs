use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::ConfigLocator;

use super::{utils, AuthError, AuthRequestState, Session};

const ENVELOPE_VERSION: u32 = 1;

/// Key-value persistence backend. Every call is atomic: readers never observe a
/// partially written value.
pub trait StoreBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    /// Store `value` only when `key` is absent. Returns whether it was stored.
    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AuthError>;
    /// Remove `key`, returning its previous value. At most one caller observes `Some`.
    fn remove(&self, key: &str) -> Result<Option<String>, AuthError>;
}

/// Process-local backend; contexts sharing one instance share their session.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.entries().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AuthError> {
        let mut entries = self.entries();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<Option<String>, AuthError> {
        Ok(self.entries().remove(key))
    }
}

/// Filesystem backend storing one user-only file per key.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn with_locator(locator: &ConfigLocator) -> Result<Self, AuthError> {
        Self::new(locator.store_dir())
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AuthError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(AuthError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid storage key '{key}'"),
            )));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn scratch_path(&self, key: &str, purpose: &str) -> PathBuf {
        let suffix = &utils::random_token()[..12];
        self.dir.join(format!(".{key}.{purpose}.{suffix}"))
    }

    fn write_scratch(&self, key: &str, payload: &str) -> Result<PathBuf, AuthError> {
        let path = self.scratch_path(key, "tmp");
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = file.metadata()?.permissions();
            perm.set_mode(0o600);
            fs::set_permissions(&path, perm)?;
        }

        Ok(path)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, AuthError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

impl StoreBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        read_optional(&self.path_for(key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let path = self.path_for(key)?;
        let scratch = self.write_scratch(key, value)?;
        if let Err(err) = fs::rename(&scratch, &path) {
            let _ = fs::remove_file(&scratch);
            return Err(err.into());
        }
        Ok(())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AuthError> {
        let path = self.path_for(key)?;
        let scratch = self.write_scratch(key, value)?;
        let linked = fs::hard_link(&scratch, &path);
        fs::remove_file(&scratch)?;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<Option<String>, AuthError> {
        let path = self.path_for(key)?;
        let claimed = self.scratch_path(key, "claim");
        match fs::rename(&path, &claimed) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let value = fs::read_to_string(&claimed);
        fs::remove_file(&claimed)?;
        Ok(Some(value?))
    }
}

/// Storage namespace derived from the provider and client identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageScope(String);

impl StorageScope {
    pub fn new(issuer: &str, client_id: &str) -> Self {
        let digest = Sha256::digest(format!("{}\n{client_id}", issuer.trim_end_matches('/')));
        let hex: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn key(&self, item: &str) -> String {
        format!("oidc.{}.{item}", self.0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    scope: String,
    value: T,
}

/// Typed access to the session and pending request of one storage scope.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn StoreBackend>,
    scope: StorageScope,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(backend: Arc<dyn StoreBackend>, scope: StorageScope) -> Self {
        Self { backend, scope }
    }

    pub fn in_memory(scope: StorageScope) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), scope)
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn load_session(&self) -> Result<Option<Session>, AuthError> {
        self.read(&self.scope.key("session"))
    }

    pub fn save_session(&self, session: &Session) -> Result<(), AuthError> {
        let payload = self.encode(session)?;
        self.backend.set(&self.scope.key("session"), &payload)
    }

    pub fn remove_session(&self) -> Result<Option<Session>, AuthError> {
        self.backend
            .remove(&self.scope.key("session"))?
            .map(|raw| self.decode(&raw))
            .transpose()
    }

    pub fn load_request(&self) -> Result<Option<AuthRequestState>, AuthError> {
        self.read(&self.scope.key("request"))
    }

    /// Persist a pending request unless one already exists.
    pub fn save_request_if_absent(&self, request: &AuthRequestState) -> Result<bool, AuthError> {
        let payload = self.encode(request)?;
        self.backend
            .set_if_absent(&self.scope.key("request"), &payload)
    }

    /// Atomically consume the pending request.
    pub fn take_request(&self) -> Result<Option<AuthRequestState>, AuthError> {
        self.backend
            .remove(&self.scope.key("request"))?
            .map(|raw| self.decode(&raw))
            .transpose()
    }

    /// Remove every value of this scope.
    pub fn clear(&self) -> Result<(), AuthError> {
        self.backend.remove(&self.scope.key("session"))?;
        self.backend.remove(&self.scope.key("request"))?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AuthError> {
        self.backend
            .get(key)?
            .map(|raw| self.decode(&raw))
            .transpose()
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<String, AuthError> {
        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            scope: self.scope.as_str().to_owned(),
            value,
        };
        Ok(serde_json::to_string_pretty(&envelope)?)
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<T, AuthError> {
        let envelope: Envelope<T> = serde_json::from_str(raw)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(AuthError::Protocol(format!(
                "unsupported storage version {}",
                envelope.version
            )));
        }
        Ok(envelope.value)
    }
}
