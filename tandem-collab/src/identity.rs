//! Per-install user identity.
//!
//! The server treats user ids as opaque, unauthenticated strings. Clients
//! generate a random UUIDv4 once and keep it on disk so the same install
//! shows up under the same id across restarts.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Fresh random identity, not persisted.
    pub fn ephemeral() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Read the identity stored at `path`, creating and saving one if the
    /// file is missing or empty.
    pub fn load_or_create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(stored) if !stored.trim().is_empty() => return Ok(Self(stored.trim().to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let identity = Self::ephemeral();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &identity.0)?;
        log::info!("Created user identity {} at {}", identity, path.display());
        Ok(identity)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for UserIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
