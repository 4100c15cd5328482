//! File transfer and path confinement.
//!
//! All file operations are confined to the in-container path `/sandbox`, the
//! writable workspace mount. Transfer goes through the runtime adapter's
//! archive primitive (a tar stream), never a raw stream splice.

use std::path::{Component, Path, PathBuf};

use base64::Engine;

use crate::error::{Result, SandboxError};

/// The fixed in-container workspace root every path is confined to.
pub const SANDBOX_ROOT: &str = "/sandbox";

/// One entry in a directory listing.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    /// Original-style relative path (no `/sandbox` prefix), for client display.
    pub path: String,
}

/// Textual or base64-encoded file content, depending on whether the bytes
/// decode as UTF-8.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub content: String,
    pub is_base64: bool,
}

/// Resolve a caller-supplied path into a confined, normalized in-container
/// path under `/sandbox`. A relative input is joined under `/sandbox`; an
/// absolute input must be lexically under `/sandbox` after normalization.
/// Any residual escape yields `invalid_path`.
pub fn resolve(input_path: &str) -> Result<String> {
    let base = Path::new(SANDBOX_ROOT);
    let candidate = if Path::new(input_path).is_absolute() {
        PathBuf::from(input_path)
    } else {
        base.join(input_path)
    };

    let normalized = normalize_lexically(&candidate);

    if normalized != base && !normalized.starts_with(base) {
        return Err(SandboxError::InvalidPath(input_path.to_string()));
    }

    Ok(normalized.to_string_lossy().into_owned())
}

/// Normalize `.` and `..` components purely lexically (no filesystem access,
/// no symlink resolution — that happens in-container, after this check).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::Prefix(_) => {}
            Component::RootDir => out.push(component.as_os_str()),
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Strip the `/sandbox` prefix for client-facing display; listing entries
/// use the caller's relative path style, not the in-container absolute one.
fn display_path(in_container_path: &str) -> String {
    in_container_path
        .strip_prefix(SANDBOX_ROOT)
        .unwrap_or(in_container_path)
        .trim_start_matches('/')
        .to_string()
}

/// Build a tar archive containing a single file at `relative_path` (relative
/// to `/sandbox`, may include subdirectories) with `content`. Extracted with
/// `/sandbox` itself as the `put_archive` destination, so the runtime creates
/// any intermediate directories.
pub fn build_single_file_tar(relative_path: &str, content: &[u8]) -> Result<Vec<u8>> {
    if relative_path.is_empty() {
        return Err(SandboxError::InvalidPath(relative_path.to_string()));
    }

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, relative_path, content)
        .map_err(|e| SandboxError::internal(format!("failed to build archive: {e}")))?;

    builder
        .into_inner()
        .map_err(|e| SandboxError::internal(format!("failed to finish archive: {e}")))
}

/// Extract the single file expected at `in_container_path` out of a tar
/// archive returned by `get_archive`, decoding as UTF-8 with a base64
/// fallback for binary content.
pub fn extract_single_file(tar_bytes: &[u8], max_bytes: u64) -> Result<FileContent> {
    let mut archive = tar::Archive::new(tar_bytes);
    let mut entries = archive
        .entries()
        .map_err(|e| SandboxError::internal(format!("failed to read archive: {e}")))?;

    let mut entry = entries
        .next()
        .ok_or_else(|| SandboxError::InvalidPath("file not found".to_string()))?
        .map_err(|e| SandboxError::internal(format!("corrupt archive entry: {e}")))?;

    let size = entry
        .header()
        .size()
        .map_err(|e| SandboxError::internal(format!("bad archive header: {e}")))?;
    if size > max_bytes {
        return Err(SandboxError::FileTooLarge { limit: max_bytes });
    }

    let mut buf = Vec::with_capacity(size as usize);
    std::io::Read::read_to_end(&mut entry, &mut buf)
        .map_err(|e| SandboxError::internal(format!("failed to read archive entry: {e}")))?;

    match String::from_utf8(buf) {
        Ok(content) => Ok(FileContent {
            content,
            is_base64: false,
        }),
        Err(e) => Ok(FileContent {
            content: base64::engine::general_purpose::STANDARD.encode(e.as_bytes()),
            is_base64: true,
        }),
    }
}

/// Parse a directory's tar archive (as returned by `get_archive` on a
/// directory path) into immediate-child entries, skipping the directory's
/// own self-entry and any nested descendants.
pub fn list_entries(tar_bytes: &[u8]) -> Result<Vec<FileEntry>> {
    let mut archive = tar::Archive::new(tar_bytes);
    let entries = archive
        .entries()
        .map_err(|e| SandboxError::internal(format!("failed to read archive: {e}")))?;

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SandboxError::internal(format!("corrupt archive entry: {e}")))?;
        let path = entry.path().map_err(|e| SandboxError::internal(e.to_string()))?;
        let path = path.to_string_lossy();
        let trimmed = path.trim_end_matches('/');
        // Depth 0 is the requested directory itself; depth 1 is an immediate child.
        let depth = trimmed.matches('/').count();
        if depth != 1 {
            continue;
        }
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed).to_string();
        out.push(FileEntry {
            is_dir: entry.header().entry_type().is_dir(),
            path: display_path(&format!("/{trimmed}")),
            name,
        });
    }
    Ok(out)
}

/// Payload size check shared by read and write: exceeding `max_bytes` is
/// `file_too_large`, exactly at the cap succeeds.
pub fn check_size(len: usize, max_bytes: u64) -> Result<()> {
    if len as u64 > max_bytes {
        return Err(SandboxError::FileTooLarge { limit: max_bytes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_joins_under_sandbox() {
        assert_eq!(resolve("ok.txt").unwrap(), "/sandbox/ok.txt");
        assert_eq!(resolve(".").unwrap(), "/sandbox");
        assert_eq!(resolve("a/b/c.txt").unwrap(), "/sandbox/a/b/c.txt");
    }

    #[test]
    fn escapes_are_rejected() {
        assert!(resolve("..").is_err());
        assert!(resolve("../x").is_err());
        assert!(resolve("/etc/passwd").is_err());
        assert!(resolve("/sandbox/../x").is_err());
        assert!(resolve("a/../../x").is_err());
    }

    #[test]
    fn absolute_path_under_sandbox_is_allowed() {
        assert_eq!(resolve("/sandbox/ok.txt").unwrap(), "/sandbox/ok.txt");
    }

    #[test]
    fn size_cap_boundary() {
        assert!(check_size(10, 10).is_ok());
        assert!(check_size(11, 10).is_err());
    }

    #[test]
    fn single_file_round_trip() {
        let tar_bytes = build_single_file_tar("ok.txt", b"hello").unwrap();
        let content = extract_single_file(&tar_bytes, 1024).unwrap();
        assert_eq!(content.content, "hello");
        assert!(!content.is_base64);
    }

    #[test]
    fn nested_path_round_trip() {
        let tar_bytes = build_single_file_tar("a/b/c.txt", b"nested").unwrap();
        let content = extract_single_file(&tar_bytes, 1024).unwrap();
        assert_eq!(content.content, "nested");
    }

    #[test]
    fn binary_content_is_base64_encoded() {
        let bytes = vec![0xffu8, 0x00, 0xfe, 0x80];
        let tar_bytes = build_single_file_tar("bin.dat", &bytes).unwrap();
        let content = extract_single_file(&tar_bytes, 1024).unwrap();
        assert!(content.is_base64);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(content.content)
            .unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let tar_bytes = build_single_file_tar("big.txt", &vec![b'x'; 100]).unwrap();
        assert!(extract_single_file(&tar_bytes, 10).is_err());
    }
}
