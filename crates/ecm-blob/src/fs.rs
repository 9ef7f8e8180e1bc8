use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{BlobError, BlobResult};
use crate::traits::{BlobStore, StoredBlobInfo};

/// Directory holding in-flight writes before they are renamed into place.
const TMP_DIR: &str = "tmp";

/// Directory holding the binaries.
const DATA_DIR: &str = "data";

/// Filesystem blob store.
///
/// On-disk layout:
/// ```text
/// <root>/data/<k0k1>/<k2k3>/<key>
/// <root>/tmp/            (write staging, renamed into data/ on completion)
/// ```
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never observes a partially written binary. The storage id is the
/// canonical root path: two stores opened on the same directory share
/// storage.
pub struct FileSystemBlobStore {
    root: PathBuf,
    storage_id: String,
}

impl FileSystemBlobStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path) -> BlobResult<Self> {
        fs::create_dir_all(root.join(DATA_DIR))?;
        fs::create_dir_all(root.join(TMP_DIR))?;
        let root = fs::canonicalize(root)?;
        let storage_id = format!("file:{}", root.display());
        Ok(Self { root, storage_id })
    }

    /// The canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        validate_key(key)?;
        let mut path = self.root.join(DATA_DIR);
        let chars: Vec<char> = key.chars().take(4).collect();
        if chars.len() == 4 {
            path.push(chars[..2].iter().collect::<String>());
            path.push(chars[2..].iter().collect::<String>());
        }
        path.push(key);
        Ok(path)
    }
}

fn validate_key(key: &str) -> BlobResult<()> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key.contains('/')
        || key.contains('\\')
        || key.contains('\0')
    {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

impl BlobStore for FileSystemBlobStore {
    fn storage_id(&self) -> &str {
        &self.storage_id
    }

    fn put(&self, key: &str, data: &[u8]) -> BlobResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join(TMP_DIR))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| BlobError::Io(e.error))?;
        debug!(key, len = data.len(), "binary written");
        Ok(())
    }

    fn get(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.path_for(key)?.is_file())
    }

    fn delete(&self, key: &str) -> BlobResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> BlobResult<Vec<StoredBlobInfo>> {
        let mut infos = Vec::new();
        for entry in WalkDir::new(self.root.join(DATA_DIR)) {
            let entry = entry.map_err(|e| {
                BlobError::Io(e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "filesystem loop while listing blobs")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| {
                BlobError::Io(e.into_io_error().unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "cannot stat blob")
                }))
            })?;
            infos.push(StoredBlobInfo {
                key: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                written_at: metadata.modified()?,
            });
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

impl std::fmt::Debug for FileSystemBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemBlobStore")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, FileSystemBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemBlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, store) = open_temp();
        store.put("abcdef0123", b"payload").unwrap();
        assert_eq!(store.get("abcdef0123").unwrap().as_deref(), Some(&b"payload"[..]));
        assert!(store.exists("abcdef0123").unwrap());
    }

    #[test]
    fn nested_layout_uses_key_prefix() {
        let (_dir, store) = open_temp();
        store.put("abcdef0123", b"x").unwrap();
        assert!(store.root().join("data/ab/cd/abcdef0123").is_file());
    }

    #[test]
    fn short_keys_live_at_data_root() {
        let (_dir, store) = open_temp();
        store.put("ab", b"x").unwrap();
        assert!(store.root().join("data/ab").is_file());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn missing_key_reads_none_and_deletes_false() {
        let (_dir, store) = open_temp();
        assert!(store.get("0000").unwrap().is_none());
        assert!(!store.delete("0000").unwrap());
    }

    #[test]
    fn rejects_path_traversal() {
        let (_dir, store) = open_temp();
        assert!(matches!(store.put("../evil", b"x"), Err(BlobError::InvalidKey(_))));
        assert!(matches!(store.get(".."), Err(BlobError::InvalidKey(_))));
    }

    #[test]
    fn list_skips_staging_area() {
        let (_dir, store) = open_temp();
        store.put("k1k1k1", b"1").unwrap();
        store.put("k2k2k2", b"22").unwrap();
        fs::write(store.root().join(TMP_DIR).join("partial"), b"zzz").unwrap();
        let infos = store.list().unwrap();
        let keys: Vec<&str> = infos.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["k1k1k1", "k2k2k2"]);
        assert_eq!(infos[1].size, 2);
    }

    #[test]
    fn same_root_shares_storage_id() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileSystemBlobStore::open(dir.path()).unwrap();
        let b = FileSystemBlobStore::open(dir.path()).unwrap();
        assert_eq!(a.storage_id(), b.storage_id());
        a.put("shared-key", b"x").unwrap();
        assert!(b.exists("shared-key").unwrap());
    }
}
