//! Locating the external tunnel binary.

use std::path::{Path, PathBuf};

/// Return the first candidate that exists on disk, falling back to a `PATH`
/// lookup of `path_name`.
pub fn resolve_binary(candidates: &[PathBuf], path_name: &str) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .or_else(|| which::which(path_name).ok())
}

/// Best-effort `chmod 0755`; errors are ignored.
pub fn ensure_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mut perms = meta.permissions();
            if perms.mode() & 0o111 == 0 {
                perms.set_mode(0o755);
                let _ = std::fs::set_permissions(path, perms);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
