//! State document persistence.
//!
//! The state document is the serialized [`VmConfig`] (runtime snapshot
//! included) at `{state_dir}/state.json`. It is the authoritative record;
//! hyperkit's own PID file only cross-checks it.

use std::collections::HashSet;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::layout::{self, StateLayout, files};
use crate::process;

/// Creates the state directory (mode 0700) if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(Error::file("create state directory", dir))
}

/// Persists `config` as the state document of its state directory.
///
/// The document is written to a temporary file and renamed into place so
/// readers never see a partial write.
pub fn save(config: &VmConfig) -> Result<()> {
    let Some(dir) = config.state_dir.as_deref() else {
        return Err(Error::InvalidConfig("cannot save state without a state directory".into()));
    };
    let layout = StateLayout::new(dir);
    let path = layout.state_file();
    let tmp = dir.join(files::STATE_TMP);

    let data = serde_json::to_vec_pretty(config).map_err(io::Error::other)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(&tmp)
        .map_err(Error::file("write state", &tmp))?;
    file.write_all(&data)
        .and_then(|()| file.sync_all())
        .map_err(Error::file("write state", &tmp))?;
    fs::rename(&tmp, &path).map_err(Error::file("write state", &path))?;

    tracing::debug!(path = %path.display(), pid = config.pid, "saved state document");
    Ok(())
}

/// Reads the state document without consulting the process table.
pub fn read_document(dir: &Path) -> Result<VmConfig> {
    let path = StateLayout::new(dir).state_file();
    let data = match fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NoState(dir.to_owned()));
        }
        Err(e) => return Err(Error::file("read state", path)(e)),
    };
    let mut config: VmConfig =
        serde_json::from_slice(&data).map_err(|source| Error::CorruptState {
            path: path.clone(),
            source,
        })?;
    // The directory the document was found in wins over whatever it recorded.
    config.state_dir = Some(dir.to_owned());
    Ok(config)
}

/// Checks that the document's PID matches hyperkit's PID file and is alive.
pub fn verify_pid(config: &VmConfig) -> Result<()> {
    let file = config
        .state_dir
        .as_deref()
        .and_then(|d| process::read_pid_file(&StateLayout::new(d).pid_file()));
    if config.pid == 0 || file != Some(config.pid) || !process::is_alive(config.pid) {
        return Err(Error::PidMismatch {
            state: config.pid,
            file,
        });
    }
    Ok(())
}

/// Reads the state document and verifies its PID.
pub fn load(dir: &Path) -> Result<VmConfig> {
    let config = read_document(dir)?;
    verify_pid(&config)?;
    Ok(config)
}

/// Removes what hkit and hyperkit created in `dir`.
///
/// Provisioned `diskNN.img` images survive when `keep_disk` is set. Disks the
/// caller supplied by path are never removed, even when they live inside
/// the state directory. The directory itself goes only if it ends up empty.
pub fn clear_if_owned(dir: &Path, keep_disk: bool) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::file("read state directory", dir)(e)),
    };
    let owned = OwnedDisks::from_document(dir);

    for entry in entries {
        let entry = entry.map_err(Error::file("read state directory", dir))?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry
            .file_type()
            .map_err(Error::file("stat", &path))?;

        let remove = match name.as_ref() {
            files::STATE | files::STATE_TMP | files::PID | files::TTY | files::CONSOLE_RING => true,
            _ if file_type.is_socket() => true,
            _ => !keep_disk && owned.contains(&path, &name),
        };
        if remove {
            tracing::debug!(path = %path.display(), "removing");
            fs::remove_file(&path).map_err(Error::file("remove", &path))?;
        }
    }

    let empty = fs::read_dir(dir)
        .map_err(Error::file("read state directory", dir))?
        .next()
        .is_none();
    if empty {
        fs::remove_dir(dir).map_err(Error::file("remove state directory", dir))?;
    }
    Ok(())
}

/// Which disk images in a state directory hkit provisioned.
#[derive(Debug)]
enum OwnedDisks {
    /// Known from the state document.
    Known {
        /// Provisioned image paths.
        provisioned: HashSet<PathBuf>,
        /// Caller-supplied image paths.
        supplied: HashSet<PathBuf>,
    },
    /// No readable document: fall back to the `diskNN.img` naming.
    ByName,
}

impl OwnedDisks {
    /// Derives ownership from the state document in `dir`, if readable.
    fn from_document(dir: &Path) -> Self {
        let Ok(config) = read_document(dir) else {
            return Self::ByName;
        };
        let layout = StateLayout::new(dir);
        let mut provisioned = HashSet::new();
        let mut supplied = HashSet::new();
        for (i, disk) in config.disks.iter().enumerate() {
            match disk.image_path() {
                Some(p) => supplied.insert(p.to_owned()),
                None => provisioned.insert(layout.disk_image(i)),
            };
        }
        Self::Known {
            provisioned,
            supplied,
        }
    }

    /// Returns `true` if `path` is a disk image hkit provisioned.
    fn contains(&self, path: &Path, name: &str) -> bool {
        match self {
            Self::Known {
                provisioned,
                supplied,
            } => provisioned.contains(path) && !supplied.contains(path),
            Self::ByName => layout::is_disk_image_name(name),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;

    use tempfile::TempDir;

    use super::*;
    use crate::config::{Console, DiskSpec};

    fn config(dir: &Path) -> VmConfig {
        VmConfig::new(dir)
            .kernel("/k", "/i")
            .console(Console::File)
            .disk(DiskSpec::new(100))
    }

    #[test]
    fn save_then_read_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        ensure_dir(&dir).unwrap();

        let mut cfg = config(&dir).vsock(true).vsock_port(5000);
        cfg.pid = 4242;
        cfg.argv = vec!["-A".into(), "-u".into()];
        cfg.cmdline = "console=ttyS0".into();
        save(&cfg).unwrap();

        assert_eq!(read_document(&dir).unwrap(), cfg);
        let mode = fs::metadata(StateLayout::new(&dir).state_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn missing_and_corrupt_documents() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(read_document(tmp.path()), Err(Error::NoState(_))));

        fs::write(tmp.path().join("state.json"), b"{not json").unwrap();
        assert!(matches!(
            read_document(tmp.path()),
            Err(Error::CorruptState { .. })
        ));
    }

    #[test]
    fn load_requires_matching_live_pid() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.pid = std::process::id();
        save(&cfg).unwrap();

        // No PID file yet.
        assert!(matches!(
            load(tmp.path()),
            Err(Error::PidMismatch { file: None, .. })
        ));

        fs::write(tmp.path().join("hyperkit.pid"), "1\n").unwrap();
        assert!(matches!(
            load(tmp.path()),
            Err(Error::PidMismatch { file: Some(1), .. })
        ));

        fs::write(tmp.path().join("hyperkit.pid"), format!("{}\n", cfg.pid)).unwrap();
        assert_eq!(load(tmp.path()).unwrap().pid, cfg.pid);
    }

    #[test]
    fn load_rejects_dead_pid() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(tmp.path());
        cfg.pid = 999_999_999;
        save(&cfg).unwrap();
        fs::write(tmp.path().join("hyperkit.pid"), "999999999").unwrap();
        assert!(matches!(load(tmp.path()), Err(Error::PidMismatch { .. })));
    }

    #[test]
    fn clear_keeps_supplied_disks() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        ensure_dir(&dir).unwrap();
        let supplied = dir.join("mine.img");

        let cfg = config(&dir).disk(DiskSpec::at(&supplied));
        save(&cfg).unwrap();
        for name in ["hyperkit.pid", "console-ring", "disk00.img", "mine.img"] {
            fs::write(dir.join(name), b"x").unwrap();
        }
        std::os::unix::fs::symlink("/dev/null", dir.join("tty")).unwrap();
        let _sock = UnixListener::bind(dir.join("00000003.00001388")).unwrap();

        clear_if_owned(&dir, false).unwrap();

        let left: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(left, vec!["mine.img"]);
    }

    #[test]
    fn clear_with_keep_disk_preserves_images() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        ensure_dir(&dir).unwrap();
        save(&config(&dir)).unwrap();
        fs::write(dir.join("disk00.img"), b"x").unwrap();

        clear_if_owned(&dir, true).unwrap();

        assert!(dir.join("disk00.img").exists());
        assert!(!dir.join("state.json").exists());
    }

    #[test]
    fn clear_removes_emptied_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        ensure_dir(&dir).unwrap();
        save(&config(&dir)).unwrap();
        fs::write(dir.join("disk00.img"), b"x").unwrap();

        clear_if_owned(&dir, false).unwrap();
        assert!(!dir.exists());

        // Already gone: still fine.
        clear_if_owned(&dir, false).unwrap();
    }

    #[test]
    fn clear_removes_interrupted_save() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("vm");
        ensure_dir(&dir).unwrap();
        save(&config(&dir)).unwrap();
        fs::write(dir.join(".state.json.tmp"), b"{\"pi").unwrap();

        clear_if_owned(&dir, false).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn clear_without_document_uses_names() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("disk01.img"), b"x").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();

        clear_if_owned(tmp.path(), false).unwrap();
        assert!(!tmp.path().join("disk01.img").exists());
        assert!(tmp.path().join("notes.txt").exists());
    }
}
