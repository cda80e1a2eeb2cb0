//! Atomic file replacement and small encoding helpers.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use base64::Engine;

use crate::error::{Result, WalletError};

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents, never a torn file: temp file in the same directory, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| WalletError::storage("mkdir", e))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| WalletError::StorageFailure(format!("not a file path: {}", path.display())))?;
    let tmp = parent.join(format!(".{name}.{}", super::paths::ext::TEMP));

    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(&tmp).map_err(|e| WalletError::storage("open temp", e))?;
        file.write_all(bytes).map_err(|e| WalletError::storage("write temp", e))?;
        file.sync_all().map_err(|e| WalletError::storage("fsync", e))?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        WalletError::storage("rename", e)
    })?;

    // Persist the rename itself.
    #[cfg(unix)]
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn encode_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_base64(value: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value.trim())
        .map_err(|e| WalletError::StorageFailure(format!("base64: {e}")))
}
