use glob::Pattern;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// One regular file discovered under a source folder. `path` is relative
/// to the folder and always forward-slash separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: String,
    pub mtime: i64,
    pub size: i64,
}

pub fn unix_mtime(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

/// Recursively collect the regular files under `root` that match `pattern`
/// (all of them when no pattern is given). Symlinks are included only when
/// they resolve to a regular file inside the source subtree; symlinked
/// directories are never descended, which also rules out cycles. Unreadable
/// entries are skipped, not fatal.
pub async fn walk_source(
    root: &Path,
    pattern: Option<&str>,
) -> Result<Vec<ScannedFile>, ScanError> {
    let pattern = match pattern {
        Some(raw) => Some(Pattern::new(raw).map_err(|source| ScanError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })?),
        None => None,
    };

    let mut files = Vec::new();
    if !fs::try_exists(root).await.unwrap_or(false) {
        debug!("Source folder does not exist: {:?}", root);
        return Ok(files);
    }
    let Ok(canonical_root) = fs::canonicalize(root).await else {
        warn!("Failed to resolve source folder: {:?}", root);
        return Ok(files);
    };

    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read directory {:?}: {}", dir, e);
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read entry in {:?}: {}", dir, e);
                    break;
                }
            };
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            if file_type.is_dir() {
                stack.push(path);
                continue;
            }

            let metadata = if file_type.is_symlink() {
                let Ok(resolved) = fs::canonicalize(&path).await else {
                    debug!("Skipping broken symlink: {:?}", path);
                    continue;
                };
                if !resolved.starts_with(&canonical_root) {
                    debug!("Skipping symlink leaving the source tree: {:?}", path);
                    continue;
                }
                match fs::metadata(&path).await {
                    Ok(m) if m.is_file() => m,
                    _ => continue,
                }
            } else if file_type.is_file() {
                match entry.metadata().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Failed to stat {:?}: {}", path, e);
                        continue;
                    }
                }
            } else {
                continue;
            };

            let Some(relative) = relative_key(root, &path) else {
                continue;
            };
            if let Some(pattern) = &pattern {
                if !pattern.matches(&relative) {
                    continue;
                }
            }
            files.push(ScannedFile {
                path: relative,
                mtime: unix_mtime(&metadata),
                size: metadata.len() as i64,
            });
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as std_fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, relative: &str, contents: &[u8]) {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std_fs::create_dir_all(parent).unwrap();
        }
        std_fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_walk_collects_nested_files_with_forward_slashes() {
        let dir = TempDir::new().unwrap();
        write(&dir, "top.txt", b"1");
        write(&dir, "sub/inner.txt", b"22");
        write(&dir, "sub/deeper/leaf.txt", b"333");

        let files = walk_source(dir.path(), None).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["sub/deeper/leaf.txt", "sub/inner.txt", "top.txt"]);
        assert_eq!(files[0].size, 3);
        assert!(files[0].mtime > 0);
    }

    #[tokio::test]
    async fn test_walk_applies_pattern() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.log", b"a");
        write(&dir, "b.log", b"b");
        write(&dir, "c.txt", b"c");

        let files = walk_source(dir.path(), Some("*.log")).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.log", "b.log"]);
    }

    #[tokio::test]
    async fn test_walk_rejects_invalid_pattern() {
        let dir = TempDir::new().unwrap();
        let err = walk_source(dir.path(), Some("[")).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn test_walk_of_missing_folder_is_empty() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let files = walk_source(&missing, None).await.unwrap();
        assert!(files.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_skips_out_of_tree_symlinks() {
        let outside = TempDir::new().unwrap();
        write(&outside, "secret.txt", b"outside");

        let dir = TempDir::new().unwrap();
        write(&dir, "inside.txt", b"inside");
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("escape.txt"),
        )
        .unwrap();

        let files = walk_source(dir.path(), None).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["inside.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_follows_in_tree_file_symlinks() {
        let dir = TempDir::new().unwrap();
        write(&dir, "real.txt", b"data");
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("alias.txt"))
            .unwrap();

        let files = walk_source(dir.path(), None).await.unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["alias.txt", "real.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_skips_broken_symlinks() {
        let dir = TempDir::new().unwrap();
        write(&dir, "ok.txt", b"ok");
        std::os::unix::fs::symlink(dir.path().join("gone.txt"), dir.path().join("dangling.txt"))
            .unwrap();

        let files = walk_source(dir.path(), None).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "ok.txt");
    }
}
