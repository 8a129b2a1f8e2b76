//! Directory-backed key-value store for persistent storage.
//!
//! The store directory has this layout:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK                 # Advisory lock for single-process access
//! ├─ <escaped-key>.kv     # One file per key
//! └─ <escaped-key>.kv.tmp # Transient, only during a write
//! ```
//!
//! Every `set` writes a temporary file, syncs it, renames it over the old
//! value and syncs the directory, so a crash leaves either the old or the
//! new value, never a torn one.

use crate::backend::KeyValueStore;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const VALUE_EXT: &str = "kv";
const TEMP_EXT: &str = "kv.tmp";

/// A persistent key-value store rooted at a directory.
///
/// # Thread Safety
///
/// The store holds an exclusive advisory lock on its directory for as long
/// as it is alive. A second `FileStore` on the same directory, in this or any
/// other process, fails with [`StorageError::Locked`].
///
/// Blocking file I/O runs on the tokio blocking pool.
///
/// # Example
///
/// ```no_run
/// use pecal_storage::FileStore;
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("pecal-data")).unwrap();
/// println!("values live in {:?}", store.path());
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: Arc<PathBuf>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path exists and is not a directory
    /// - Another store holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("store path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        Ok(Self {
            root: Arc::new(path.to_path_buf()),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Lists the keys currently stored, in sorted order.
    pub async fn keys(&self) -> StorageResult<Vec<String>> {
        let root = Arc::clone(&self.root);
        run_blocking(move || {
            let mut keys = Vec::new();
            for entry in fs::read_dir(root.as_path())? {
                let name = entry?.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if let Some(stem) = name.strip_suffix(&format!(".{VALUE_EXT}")) {
                    if let Some(key) = unescape_key(stem) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    fn value_path(&self, key: &str) -> StorageResult<PathBuf> {
        let name = escape_key(key)?;
        Ok(self.root.join(format!("{name}.{VALUE_EXT}")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.value_path(key)?;
        run_blocking(move || match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        })
        .await
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        let path = self.value_path(key)?;
        let temp_path = path.with_extension(TEMP_EXT);
        let root = Arc::clone(&self.root);
        run_blocking(move || {
            let mut file = File::create(&temp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
            drop(file);

            fs::rename(&temp_path, &path)?;
            sync_directory(&root)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.value_path(key)?;
        let root = Arc::clone(&self.root);
        run_blocking(move || match fs::remove_file(&path) {
            Ok(()) => {
                sync_directory(&root)?;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        })
        .await
    }
}

async fn run_blocking<T, F>(task: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| StorageError::Task(err.to_string()))?
}

/// Maps a key to a file-name-safe string.
///
/// ASCII alphanumerics, `_` and `-` pass through; every other byte becomes
/// `%XX`. The result never starts with `.` and never contains a separator.
fn escape_key(key: &str) -> StorageResult<String> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let mut escaped = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(char::from(byte));
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(escaped)
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> io::Result<()> {
    // NTFS journals metadata; directory handles cannot be fsynced.
    Ok(())
}
