//! Credential persistence using SQLite

use crate::error::{Error, Result};
use crate::models::*;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct LocalStorage {
    conn: Mutex<Connection>,
}

impl LocalStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let conn = Connection::open(data_dir.as_ref().join("classlink.db"))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                role TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at INTEGER
            );
            "#,
        )?;

        Ok(())
    }

    /// Makes every later write fail.
    #[cfg(test)]
    pub(crate) fn drop_schema(&self) {
        self.conn
            .lock()
            .execute_batch("DROP TABLE credentials;")
            .unwrap();
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub fn save_credential(&self, credential: &Credential) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT OR REPLACE INTO credentials
               (role, participant_id, access_token, refresh_token, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                credential.role.as_str(),
                credential.participant_id,
                credential.access_token,
                credential.refresh_token,
                credential.expires_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_credential(&self, role: Role) -> Result<Option<Credential>> {
        let conn = self.conn.lock();
        let credential = conn
            .query_row(
                r#"SELECT participant_id, access_token, refresh_token, expires_at
                   FROM credentials WHERE role = ?1"#,
                params![role.as_str()],
                |row| {
                    Ok(Credential {
                        participant_id: row.get(0)?,
                        role,
                        access_token: row.get(1)?,
                        refresh_token: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(credential)
    }

    pub fn delete_credential(&self, role: Role) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM credentials WHERE role = ?1",
            params![role.as_str()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Credential store
// ============================================================================

/// Holds the active credential pair for this client.
///
/// Cloning yields another handle to the same store. Only login, logout and
/// the refresh coordinator write to it; everything else reads.
#[derive(Clone)]
pub struct CredentialStore {
    current: Arc<RwLock<Option<Credential>>>,
    storage: Option<Arc<LocalStorage>>,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            storage: None,
        }
    }

    pub fn persistent(storage: Arc<LocalStorage>) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            storage: Some(storage),
        }
    }

    /// Loads the credential persisted for `role`, if any.
    pub fn restore(storage: Arc<LocalStorage>, role: Role) -> Result<Self> {
        let credential = storage.load_credential(role)?;
        if let Some(ref c) = credential {
            debug!(role = role.as_str(), participant = %c.participant_id, "restored credential");
        }
        Ok(Self {
            current: Arc::new(RwLock::new(credential)),
            storage: Some(storage),
        })
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.read().is_some()
    }

    /// Stores the credential obtained at login.
    pub fn sign_in(&self, credential: Credential) -> Result<()> {
        self.persist(&credential)?;
        *self.current.write() = Some(credential);
        Ok(())
    }

    /// Swaps in a rotated pair for the same participant.
    pub(crate) fn replace(&self, credential: Credential) -> Result<()> {
        {
            let current = self.current.read();
            match current.as_ref() {
                Some(c) if c.participant_id == credential.participant_id => {}
                Some(c) => {
                    return Err(Error::invalid_state(
                        "replace the credential",
                        format!("signed in as {}", c.participant_id),
                    ))
                }
                None => return Err(Error::NotLoggedIn),
            }
        }
        self.persist(&credential)?;
        *self.current.write() = Some(credential);
        Ok(())
    }

    /// Drops the credential from memory and from disk.
    pub fn clear(&self) -> Result<()> {
        let previous = self.current.write().take();
        if let (Some(storage), Some(credential)) = (&self.storage, previous) {
            storage.delete_credential(credential.role)?;
        }
        Ok(())
    }

    fn persist(&self, credential: &Credential) -> Result<()> {
        if let Some(ref storage) = self.storage {
            storage.save_credential(credential)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(access: &str, refresh: &str) -> Credential {
        Credential::new(
            "tutor-7",
            Role::Tutor,
            TokenPair {
                access_token: access.into(),
                refresh_token: refresh.into(),
            },
        )
    }

    #[test]
    fn test_credential_survives_reload() {
        let dir = tempfile::tempdir().unwrap();

        {
            let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());
            let store = CredentialStore::persistent(storage);
            store.sign_in(credential("a1", "r1")).unwrap();
        }

        let storage = Arc::new(LocalStorage::new(dir.path()).unwrap());
        let restored = CredentialStore::restore(storage.clone(), Role::Tutor).unwrap();
        assert_eq!(restored.current().unwrap().refresh_token, "r1");

        let other_role = CredentialStore::restore(storage, Role::Student).unwrap();
        assert!(other_role.current().is_none());
    }

    #[test]
    fn test_replace_swaps_both_tokens() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let store = CredentialStore::persistent(storage.clone());
        store.sign_in(credential("a1", "r1")).unwrap();

        store.replace(credential("a2", "r2")).unwrap();

        let current = store.current().unwrap();
        assert_eq!(current.access_token, "a2");
        assert_eq!(current.refresh_token, "r2");
        let on_disk = storage.load_credential(Role::Tutor).unwrap().unwrap();
        assert_eq!(on_disk, current);
    }

    #[test]
    fn test_replace_rejects_foreign_identity() {
        let store = CredentialStore::in_memory();
        store.sign_in(credential("a1", "r1")).unwrap();

        let mut foreign = credential("a2", "r2");
        foreign.participant_id = "stu-1".into();
        assert!(matches!(store.replace(foreign), Err(Error::InvalidState { .. })));
        assert_eq!(store.access_token().as_deref(), Some("a1"));
    }

    #[test]
    fn test_clear_removes_persisted_row() {
        let storage = Arc::new(LocalStorage::in_memory().unwrap());
        let store = CredentialStore::persistent(storage.clone());
        store.sign_in(credential("a1", "r1")).unwrap();

        store.clear().unwrap();

        assert!(!store.is_signed_in());
        assert!(storage.load_credential(Role::Tutor).unwrap().is_none());
    }
}
