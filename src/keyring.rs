//! Loading and persisting the node keypair.
//!
//! | Input | Result |
//! |-------|--------|
//! | no path | fresh ephemeral keypair, never written |
//! | path exists | 64-byte `secret || public` file, validated |
//! | path missing | new keypair, persisted atomically |
//!
//! Persisting writes a temporary file in the target directory, restricts it
//! to the owner, syncs it and renames it into place. A crash mid-write leaves
//! either no key file or a complete one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{NetError, Result};
use crate::identity::{KEYPAIR_LEN, Keypair};

/// Load the node identity from `path`, creating it if absent.
pub fn load_identity(path: Option<&Path>) -> Result<Keypair> {
    let Some(path) = path else {
        let keypair = Keypair::generate();
        debug!(fingerprint = %keypair.fingerprint(), "generated ephemeral identity");
        return Ok(keypair);
    };

    match fs::read(path) {
        Ok(bytes) => {
            let keypair = decode_keypair(&bytes)?;
            info!(
                fingerprint = %keypair.fingerprint(),
                path = %path.display(),
                "loaded identity"
            );
            Ok(keypair)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            persist_keypair(path, &keypair)?;
            info!(
                fingerprint = %keypair.fingerprint(),
                path = %path.display(),
                "generated and persisted new identity"
            );
            Ok(keypair)
        }
        Err(e) => Err(NetError::Io(e)),
    }
}

fn decode_keypair(bytes: &[u8]) -> Result<Keypair> {
    let raw: &[u8; KEYPAIR_LEN] = bytes.try_into().map_err(|_| {
        NetError::CorruptKeyMaterial(format!(
            "expected {KEYPAIR_LEN} bytes, found {}",
            bytes.len()
        ))
    })?;
    Keypair::from_keypair_bytes(raw).map_err(|_| {
        NetError::CorruptKeyMaterial("public key does not match secret key".to_string())
    })
}

/// Write `keypair` to `path` with owner-only permissions, atomically.
pub fn persist_keypair(path: &Path, keypair: &Keypair) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    restrict_to_owner(tmp.as_file())?;
    tmp.write_all(&keypair.to_keypair_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| NetError::Io(e.error))?;

    // Make the rename itself durable where the platform allows it.
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(file: &fs::File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_path_is_ephemeral() {
        let a = load_identity(None).unwrap();
        let b = load_identity(None).unwrap();
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn missing_file_is_generated_then_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let first = load_identity(Some(&path)).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), KEYPAIR_LEN);

        let second = load_identity(Some(&path)).unwrap();
        assert_eq!(first.identity(), second.identity());
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("validator").join("node.key");
        load_identity(Some(&path)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        load_identity(Some(&path)).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        fs::write(&path, [1u8; 32]).unwrap();
        let err = load_identity(Some(&path)).unwrap_err();
        assert!(matches!(err, NetError::CorruptKeyMaterial(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn mismatched_halves_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        let mut bytes = Keypair::generate().to_keypair_bytes();
        bytes[32..].copy_from_slice(&Keypair::generate().public_key_bytes());
        fs::write(&path, bytes).unwrap();
        assert!(matches!(
            load_identity(Some(&path)),
            Err(NetError::CorruptKeyMaterial(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        load_identity(Some(&path)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
