use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Longest upload name accepted, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Turns a shared-directory path as sent on the wire (`/`, `/docs/a.txt`,
/// `docs`) into a relative path that cannot escape the shared root.
///
/// Rejects:
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Embedded NUL bytes
pub fn normalize_shared_path(wire_path: &str) -> Result<PathBuf, TransferError> {
    if wire_path.contains('\0') {
        return Err(TransferError::InvalidPath("NUL byte in path".into()));
    }

    let trimmed = wire_path.trim_start_matches(['/', '\\']);
    let mut out = PathBuf::new();

    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {wire_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {wire_path}"
                )));
            }
        }
    }

    Ok(out)
}

/// Validates a client-supplied upload file name: a single path component,
/// not `.`/`..`, no separators, no NUL, at most 255 bytes.
pub fn validate_upload_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidPath("file name too long".into()));
    }
    if name == "." || name == ".." {
        return Err(TransferError::InvalidPath(format!("reserved name: {name}")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(TransferError::InvalidPath(format!(
            "file name must not contain separators: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_normalizes_to_empty() {
        assert_eq!(normalize_shared_path("/").unwrap(), PathBuf::new());
        assert_eq!(normalize_shared_path("").unwrap(), PathBuf::new());
    }

    #[test]
    fn leading_slash_is_stripped() {
        assert_eq!(
            normalize_shared_path("/docs/a.txt").unwrap(),
            PathBuf::from("docs/a.txt")
        );
        assert_eq!(
            normalize_shared_path("docs/./a.txt").unwrap(),
            PathBuf::from("docs/a.txt")
        );
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(normalize_shared_path("../../../etc/passwd").is_err());
        assert!(normalize_shared_path("/sub/../../escape").is_err());
    }

    #[test]
    fn rejects_nul() {
        assert!(normalize_shared_path("a\0b").is_err());
    }

    #[test]
    fn upload_names() {
        assert!(validate_upload_name("report.pdf").is_ok());
        assert!(validate_upload_name("with space.txt").is_ok());
        assert!(validate_upload_name("").is_err());
        assert!(validate_upload_name("..").is_err());
        assert!(validate_upload_name("a/b").is_err());
        assert!(validate_upload_name("a\\b").is_err());
        assert!(validate_upload_name(&"x".repeat(256)).is_err());
    }
}
