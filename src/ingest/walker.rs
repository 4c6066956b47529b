use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Result, TabsyncError};

/// Metadata for a discovered file
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub file_size: u64,
    pub modified: std::time::SystemTime,
}

/// File-name matcher for the configured pattern (e.g. `*.csv`).
///
/// Several patterns may be given separated by commas: `"*.csv,*.tsv"`.
#[derive(Debug, Clone)]
pub struct FilePattern {
    raw: String,
    set: GlobSet,
}

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut count = 0;
        for part in pattern.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let glob = Glob::new(part)
                .map_err(|e| TabsyncError::Config(format!("invalid file pattern '{}': {}", part, e)))?;
            builder.add(glob);
            count += 1;
        }
        if count == 0 {
            return Err(TabsyncError::Config("file pattern must not be empty".to_string()));
        }
        let set = builder
            .build()
            .map_err(|e| TabsyncError::Config(format!("invalid file pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            raw: pattern.to_string(),
            set,
        })
    }

    /// Match against the file name only, so the pattern is independent of the watch root.
    pub fn matches(&self, path: &Path) -> bool {
        path.file_name().map(|name| self.set.is_match(name)).unwrap_or(false)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Discover all files under `root` whose name matches `pattern`.
///
/// Only the top level is scanned unless `recursive` is set. Dotfiles are skipped so
/// editor swap files and partial uploads (`.products.csv.part`) never match.
pub fn discover_files(root: &Path, pattern: &FilePattern, recursive: bool) -> Result<Vec<FileMetadata>> {
    let mut files = Vec::new();
    let max_depth = if recursive { usize::MAX } else { 1 };

    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        if !path.is_file() || is_hidden(path) || !pattern.matches(path) {
            continue;
        }

        let metadata = std::fs::metadata(path)?;

        let relative_path = path
            .strip_prefix(root)
            .map_err(|_| TabsyncError::Config(format!("Failed to compute relative path for: {}", path.display())))?
            .to_string_lossy()
            .replace('\\', "/");

        files.push(FileMetadata {
            relative_path,
            absolute_path: path.to_path_buf(),
            file_size: metadata.len(),
            modified: metadata.modified()?,
        });
    }

    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    log::info!("Discovered {} files matching '{}' in {}", files.len(), pattern.as_str(), root.display());
    Ok(files)
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_pattern_matches_file_name() {
        let pattern = FilePattern::new("*.csv").unwrap();
        assert!(pattern.matches(Path::new("/data/in/products.csv")));
        assert!(!pattern.matches(Path::new("/data/in/products.csv.part")));
        assert!(!pattern.matches(Path::new("/data/in/notes.txt")));

        let multi = FilePattern::new("*.csv, *.tsv").unwrap();
        assert!(multi.matches(Path::new("a.tsv")));
        assert!(FilePattern::new(" , ").is_err());
        assert!(FilePattern::new("[").is_err());
    }

    #[test]
    fn test_discover_files_top_level_only() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("b.csv"), "x").unwrap();
        fs::write(root.path().join("a.csv"), "x").unwrap();
        fs::write(root.path().join(".hidden.csv"), "x").unwrap();
        fs::write(root.path().join("readme.md"), "x").unwrap();
        fs::create_dir(root.path().join("nested")).unwrap();
        fs::write(root.path().join("nested").join("c.csv"), "x").unwrap();

        let pattern = FilePattern::new("*.csv").unwrap();
        let files = discover_files(root.path(), &pattern, false).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);

        let files = discover_files(root.path(), &pattern, true).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().any(|f| f.relative_path == "nested/c.csv"));
    }
}
