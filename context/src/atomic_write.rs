//! Atomic file writes: temp file in the target directory, then rename.
//!
//! Where rename over an existing file fails, the old file is moved to `.bak`
//! first and restored if the second rename also fails.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    let Err(err) = tmp.persist(path) else {
        return Ok(());
    };
    if !path.exists() {
        return Err(err.error);
    }

    let backup_path = path.with_extension("bak");
    let _ = std::fs::remove_file(&backup_path);
    std::fs::rename(path, &backup_path)?;

    if let Err(rename_err) = err.file.persist(path) {
        let _ = std::fs::rename(&backup_path, path);
        return Err(rename_err.error);
    }
    if let Err(e) = std::fs::remove_file(&backup_path) {
        tracing::warn!(
            path = %backup_path.display(),
            "Failed to remove .bak after atomic write: {e}"
        );
    }
    Ok(())
}
