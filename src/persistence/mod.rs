//! Durable document storage
//!
//! Both stores persist one JSON document per validator. A write is only
//! reported successful once the document and its directory entry have been
//! flushed to disk, so an ordering between two writes survives a crash.

use crate::errors::{KeyManagerError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension used for stored documents
const DOCUMENT_EXT: &str = "json";

/// Named-document store backing the key store and slashing protection store
pub trait Persistence: Send + Sync {
    /// Atomically replace (or create) a document
    fn put(&self, name: &str, contents: &[u8]) -> Result<()>;

    /// Remove a document. Removing a missing document is an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// Read a document if it exists
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Names of all stored documents
    fn list(&self) -> Result<Vec<String>>;
}

/// Directory-backed persistence: `<dir>/<name>.json`
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `base_path`
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();

        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
        }

        Ok(Self { base_path })
    }

    fn document_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.contains(std::path::MAIN_SEPARATOR)
            || name.contains('/')
            || name.starts_with('.')
        {
            return Err(KeyManagerError::Persistence(format!(
                "invalid document name: {:?}",
                name
            )));
        }
        Ok(self.base_path.join(format!("{}.{}", name, DOCUMENT_EXT)))
    }

    /// Flush directory metadata so renames and unlinks are durable
    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        {
            File::open(&self.base_path)?.sync_all()?;
        }
        Ok(())
    }
}

impl Persistence for FileStore {
    fn put(&self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.document_path(name)?;
        let tmp_path = self.base_path.join(format!(".{}.{}.tmp", name, DOCUMENT_EXT));

        {
            let mut options = OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &path)?;
        self.sync_dir()?;

        debug!("Persisted document {:?}", path);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.document_path(name)?;
        if !path.exists() {
            return Err(KeyManagerError::KeyNotFound(name.to_string()));
        }
        fs::remove_file(&path)?;
        self.sync_dir()?;

        debug!("Removed document {:?}", path);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.document_path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map_or(false, |ext| ext == DOCUMENT_EXT) {
                if let Some(stem) = path.file_stem() {
                    let stem = stem.to_string_lossy();
                    if !stem.starts_with('.') {
                        names.push(stem.to_string());
                    }
                }
            }
        }

        names.sort();
        Ok(names)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path().join("docs")).unwrap();

        store.put("alpha", b"{\"a\":1}").unwrap();
        store.put("beta", b"{}").unwrap();
        assert_eq!(store.get("alpha").unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(store.list().unwrap(), vec!["alpha", "beta"]);

        store.put("alpha", b"{\"a\":2}").unwrap();
        assert_eq!(store.get("alpha").unwrap().unwrap(), b"{\"a\":2}");

        store.delete("alpha").unwrap();
        assert!(store.get("alpha").unwrap().is_none());
        assert!(matches!(
            store.delete("alpha"),
            Err(KeyManagerError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_path_names() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.put("", b"x").is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_document_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("secret", b"{}").unwrap();

        let mode = fs::metadata(dir.path().join("secret.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
