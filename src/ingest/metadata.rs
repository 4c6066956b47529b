use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::SystemTime;

use crate::error::Result;

/// Compute SHA256 hash of file contents, streaming so large inputs are not buffered whole.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA256 of an in-memory buffer, same encoding as [`compute_file_hash`].
pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Size and modification time observed for a path at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: SystemTime,
}

impl FileStamp {
    /// Stat a regular file; `None` if it is missing or not a file.
    pub fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(Self {
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_compute_file_hash() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.csv");
        fs::write(&file_path, "id,price\n1,2\n").unwrap();

        let hash = compute_file_hash(&file_path).unwrap();
        assert_eq!(hash.len(), 64); // SHA256 produces 64 hex chars
        assert_eq!(hash, hash_bytes(b"id,price\n1,2\n"));
    }

    #[test]
    fn test_file_stamp_missing_and_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert!(FileStamp::of(&temp_dir.path().join("nope.csv")).is_none());
        assert!(FileStamp::of(temp_dir.path()).is_none());

        let file_path = temp_dir.path().join("a.csv");
        fs::write(&file_path, "abc").unwrap();
        assert_eq!(FileStamp::of(&file_path).unwrap().size, 3);
    }
}
