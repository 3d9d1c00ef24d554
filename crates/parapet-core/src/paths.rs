//! Repository-relative path normalization and sandboxing.
//!
//! Every path that crosses the RPC boundary goes through [`normalize`] before
//! touching the catalog or the block store, so the catalog only ever stores
//! already-normalized paths.

use parapet_types::{ParapetError, Result};

/// Normalize a repository-relative path.
///
/// Accepts forward-slash paths, strips `.` components and duplicate slashes,
/// and rejects anything that could resolve outside the repository root:
/// absolute prefixes, `..` components, backslashes, drive prefixes, and null
/// bytes.
pub fn normalize(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(ParapetError::PathEscape("<empty>".into()));
    }
    if path.contains('\0') {
        return Err(ParapetError::PathEscape("<contains NUL>".into()));
    }
    if path.contains('\\') {
        return Err(ParapetError::PathEscape(path.into()));
    }
    if path.starts_with('/') {
        return Err(ParapetError::PathEscape(path.into()));
    }
    // Windows drive prefix ("C:...") would be absolute on that platform.
    if path
        .split('/')
        .next()
        .is_some_and(|first| first.len() >= 2 && first.as_bytes()[1] == b':')
    {
        return Err(ParapetError::PathEscape(path.into()));
    }

    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(ParapetError::PathEscape(path.into())),
            c => components.push(c),
        }
    }
    if components.is_empty() {
        return Err(ParapetError::PathEscape(path.into()));
    }
    Ok(components.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(normalize("a.txt").unwrap(), "a.txt");
        assert_eq!(normalize("docs/notes/a.txt").unwrap(), "docs/notes/a.txt");
    }

    #[test]
    fn strips_dot_components_and_duplicate_slashes() {
        assert_eq!(normalize("./docs//a.txt").unwrap(), "docs/a.txt");
        assert_eq!(normalize("docs/./a.txt/").unwrap(), "docs/a.txt");
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(matches!(
            normalize("../../etc/passwd"),
            Err(ParapetError::PathEscape(_))
        ));
        assert!(normalize("docs/../../escape").is_err());
        assert!(normalize("..").is_err());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(normalize("/etc/passwd").is_err());
        assert!(normalize("C:/Windows/System32").is_err());
    }

    #[test]
    fn rejects_backslash_and_nul() {
        assert!(normalize("docs\\a.txt").is_err());
        assert!(normalize("docs/a\0.txt").is_err());
    }

    #[test]
    fn rejects_empty_and_dot_only() {
        assert!(normalize("").is_err());
        assert!(normalize(".").is_err());
        assert!(normalize("./.").is_err());
    }
}
