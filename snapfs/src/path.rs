//! Path canonicalisation shared by the proxy and the authority.
//!
//! Canonical paths are relative to the served root, use `/` separators, carry
//! no `.`/`..` components and no leading or trailing slash. The root itself is
//! the empty string. Both the client cache table and the authority table are
//! keyed by canonical paths.

use crate::error::{SnapError, SnapResult};

pub trait PathNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> SnapResult<String>;
}

/// Lexical normaliser; never touches the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelativePathNormalizer;

impl PathNormalizer for RelativePathNormalizer {
    fn normalize(&self, raw: &str) -> SnapResult<String> {
        normalize(raw)
    }
}

pub fn normalize(raw: &str) -> SnapResult<String> {
    if raw.is_empty() {
        return Err(SnapError::InvalidArgument("empty path".into()));
    }
    if raw.contains('\0') {
        return Err(SnapError::InvalidArgument(format!("nul byte in path {raw:?}")));
    }
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    // climbing above the served root
                    return Err(SnapError::PermissionDenied(raw.to_string()));
                }
            }
            p => parts.push(p),
        }
    }
    Ok(parts.join("/"))
}

/// Parent directory of a canonical path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_dots_and_slashes() {
        assert_eq!(normalize("/a/b/c").unwrap(), "a/b/c");
        assert_eq!(normalize("a//b/./c/").unwrap(), "a/b/c");
        assert_eq!(normalize("./a/x/../b").unwrap(), "a/b");
        assert_eq!(normalize("/").unwrap(), "");
        assert_eq!(normalize(".").unwrap(), "");
    }

    #[test]
    fn test_normalize_rejects_escape_and_empty() {
        assert!(matches!(normalize("../etc/passwd"), Err(SnapError::PermissionDenied(_))));
        assert!(matches!(normalize("a/../../b"), Err(SnapError::PermissionDenied(_))));
        assert!(matches!(normalize(""), Err(SnapError::InvalidArgument(_))));
        assert!(matches!(normalize("a\0b"), Err(SnapError::InvalidArgument(_))));
    }

    #[test]
    fn test_parent() {
        assert_eq!(parent("a/b/c"), Some("a/b"));
        assert_eq!(parent("a"), Some(""));
        assert_eq!(parent(""), None);
    }
}
