//! Naming of kernel IPC resources.
//!
//! Every primitive is identified by a small integer id. The id picks a key
//! file `<dir>/<kind>_<id>.key`; the file's device, inode and the id are
//! hashed into the SysV key. The creating side writes the file, attaching
//! sides only read it, and the creator unlinks it on teardown.
//!
//! `ftok` keeps only 8 bits of the device and 16 of the inode, so key files
//! in different directories collide often enough to matter; the full
//! numbers go into the hash here.

use {
    crate::error::IpcError,
    std::{
        fs,
        os::unix::fs::MetadataExt,
        path::{Path, PathBuf},
    },
};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over device, inode and id, folded to a positive `key_t`.
///
/// Never returns `IPC_PRIVATE` (0).
pub fn derive_key(dev: u64, ino: u64, id: i32) -> libc::key_t {
    let mut hash = FNV_OFFSET;
    let bytes = dev
        .to_le_bytes()
        .into_iter()
        .chain(ino.to_le_bytes())
        .chain(id.to_le_bytes());
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    let folded = ((hash >> 32) ^ hash) as u32 & 0x7fff_ffff;
    folded.max(1) as libc::key_t
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcKey {
    id: i32,
    path: PathBuf,
}

impl IpcKey {
    pub fn new(dir: &Path, kind: &str, id: i32) -> Self {
        Self {
            id,
            path: dir.join(format!("{kind}_{id}.key")),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the key file (and its directory) if missing.
    pub fn ensure_file(&self) -> Result<(), IpcError> {
        let prepare = || -> std::io::Result<()> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            if !self.path.exists() {
                fs::write(&self.path, b"\n")?;
            }
            Ok(())
        };
        prepare().map_err(|source| IpcError::KeyFile {
            path: self.path.clone(),
            source,
        })
    }

    pub fn sysv_key(&self) -> Result<libc::key_t, IpcError> {
        let meta = fs::metadata(&self.path).map_err(|source| IpcError::KeyFile {
            path: self.path.clone(),
            source,
        })?;
        Ok(derive_key(meta.dev(), meta.ino(), self.id))
    }

    pub fn remove_file(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_file_naming() {
        let key = IpcKey::new(Path::new("/tmp/offload"), "msg_queue", 2);
        assert_eq!(key.path(), Path::new("/tmp/offload/msg_queue_2.key"));
        assert_eq!(key.id(), 2);
    }

    #[test]
    fn test_missing_key_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let key = IpcKey::new(dir.path(), "dual_sem", 1);
        assert!(matches!(key.sysv_key(), Err(IpcError::KeyFile { .. })));

        key.ensure_file().unwrap();
        let first = key.sysv_key().unwrap();
        assert_eq!(key.sysv_key().unwrap(), first);

        key.remove_file();
        assert!(!key.path().exists());
    }

    #[test]
    fn test_inodes_ftok_would_merge_get_distinct_keys() {
        // same low 16 inode bits, same low 8 device bits
        let a = derive_key(0x0801, 0x1_2345, 1);
        let b = derive_key(0x0801, 0x9_2345, 1);
        let c = derive_key(0x0901, 0x1_2345, 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, derive_key(0x0801, 0x1_2345, 2));
        assert_eq!(a, derive_key(0x0801, 0x1_2345, 1));
        assert!(a > 0 && b > 0 && c > 0);
    }

    #[test]
    fn test_key_files_in_separate_dirs_get_distinct_keys() {
        let dirs: Vec<_> = (0..32).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut keys = std::collections::HashSet::new();
        for dir in &dirs {
            let key = IpcKey::new(dir.path(), "dual_sem", 1);
            key.ensure_file().unwrap();
            assert!(keys.insert(key.sysv_key().unwrap()));
        }
    }
}
