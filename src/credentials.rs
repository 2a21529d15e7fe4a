//! Persistence of remote signing session credentials.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stored session: the throwaway client key, the signer it is paired with and
/// the relay used to reach it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Client secret key (hex).
    #[serde(rename = "csk")]
    pub client_secret: String,
    /// Remote signer public key (hex).
    #[serde(rename = "spk")]
    pub signer_pubkey: String,
    pub relay: String,
}

/// Where a session's credentials live between invocations.
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored. Unreadable data is a state error.
    fn load(&self) -> Result<Option<Credentials>>;
    fn save(&self, creds: &Credentials) -> Result<()>;
    /// Remove stored credentials. Succeeds when nothing is stored.
    fn clear(&self) -> Result<()>;
}

/// JSON file store, written atomically and readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let creds = serde_json::from_str(&data).map_err(|e| {
            Error::State(format!("corrupt credentials file {}: {e}", self.path.display()))
        })?;
        Ok(Some(creds))
    }

    fn save(&self, creds: &Credentials) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let data = serde_json::to_string_pretty(creds)
            .map_err(|e| Error::State(format!("encoding credentials: {e}")))?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        fs::write(tmp.path(), data)?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    creds: Mutex<Option<Credentials>>,
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credentials>> {
        Ok(self.creds.lock().map_err(|_| Error::State("store poisoned".into()))?.clone())
    }

    fn save(&self, creds: &Credentials) -> Result<()> {
        *self.creds.lock().map_err(|_| Error::State("store poisoned".into()))? = Some(creds.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.creds.lock().map_err(|_| Error::State("store poisoned".into()))? = None;
        Ok(())
    }
}
