//! Backup, swap and rollback of store file sets
//!
//! The live set is first copied to the Backup set, and a marker file is
//! written once that copy is complete. Only then is the migrated Temp set
//! moved over the live one. The marker is removed before the backup
//! files, so at startup a marker means "the backup is whole and the swap
//! may not have finished".

use coffer_core::error::{CofferError, Result};
use coffer_sqlite::StoreFiles;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File operations used by the swap. Replaceable for fault injection.
pub trait FileOps: Send + Sync {
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::copy(from, to).map(|_| ())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Marker written once the Backup set is a complete copy
pub fn backup_marker(live: &StoreFiles) -> PathBuf {
    let mut name = live.backup().main().as_os_str().to_os_string();
    name.push("-complete");
    PathBuf::from(name)
}

/// Replace the `live` set with the `temp` set, restoring the original
/// files if anything fails after the backup is taken.
pub fn swap_in(live: &StoreFiles, temp: &StoreFiles, ops: &dyn FileOps) -> Result<()> {
    let backup = live.backup();
    let marker = backup_marker(live);
    remove_set(&backup, ops)?;

    // Back up. A failure here leaves the live set untouched.
    let backed_up = (|| -> io::Result<()> {
        for (src, dst) in live.paths().iter().zip(backup.paths().iter()) {
            if src.exists() {
                ops.copy(src, dst)?;
            }
        }
        std::fs::write(&marker, b"")
    })();
    if let Err(e) = backed_up {
        let _ = remove_set(&backup, ops);
        let _ = ops.remove(&marker);
        return Err(e.into());
    }
    debug!("Backed up {}", live.main().display());

    let replaced = (|| -> io::Result<()> {
        for path in live.paths() {
            ops.remove(&path)?;
        }
        for (src, dst) in temp.paths().iter().zip(live.paths().iter()) {
            if src.exists() {
                ops.rename(src, dst)?;
            }
        }
        Ok(())
    })();

    match replaced {
        Ok(()) => {
            ops.remove(&marker)?;
            remove_set(&backup, ops)?;
            Ok(())
        }
        Err(e) => {
            warn!(
                "Swap of {} failed ({}), restoring backup",
                live.main().display(),
                e
            );
            restore_backup(live, &StdFileOps)?;
            let _ = remove_set(temp, &StdFileOps);
            Err(e.into())
        }
    }
}

/// Copy the Backup set back over the live set, then discard the backup.
fn restore_backup(live: &StoreFiles, ops: &dyn FileOps) -> Result<()> {
    let backup = live.backup();
    for (dst, src) in live.paths().iter().zip(backup.paths().iter()) {
        ops.remove(dst)?;
        if src.exists() {
            ops.copy(src, dst)?;
        }
    }
    ops.remove(&backup_marker(live))?;
    remove_set(&backup, ops)
}

/// Bring a store left behind by an interrupted migration back to a
/// consistent state. Returns true if a backup was restored.
pub fn recover_interrupted_swap(live: &StoreFiles, ops: &dyn FileOps) -> Result<bool> {
    let temp = live.temp();
    let backup = live.backup();
    let marker = backup_marker(live);

    let restored = if marker.exists() {
        info!(
            "Restoring {} from backup after interrupted migration",
            live.main().display()
        );
        restore_backup(live, ops)?;
        true
    } else {
        // A partial backup: the live set was never touched.
        if backup.exists() {
            remove_set(&backup, ops)?;
        }
        false
    };

    if temp.exists() {
        debug!("Discarding stale {}", temp.main().display());
        remove_set(&temp, ops)?;
    }
    Ok(restored)
}

/// Remove the live, Temp and Backup sets of a store.
pub fn erase_store(live: &StoreFiles) -> Result<()> {
    live.remove()?;
    live.temp().remove()?;
    live.backup().remove()?;
    StdFileOps
        .remove(&backup_marker(live))
        .map_err(CofferError::from)
}

fn remove_set(files: &StoreFiles, ops: &dyn FileOps) -> Result<()> {
    for path in files.paths() {
        ops.remove(&path)?;
    }
    Ok(())
}
