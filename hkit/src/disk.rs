//! Raw disk image provisioning.
//!
//! Images are plain sparse files. When an SSH public key is supplied, the
//! first blocks carry a ustar archive that boot2docker-style guests look for
//! on first boot: a format-me marker, then `.ssh/authorized_keys{,2}`. The
//! guest formats the disk and installs the key from that archive.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Marker the guest looks for before formatting an unformatted disk.
pub const FORMAT_MARKER: &str = "boot2docker, please format-me";

/// Bytes per MiB.
const MIB: u64 = 1024 * 1024;

/// Creates a raw image of `size_mib` MiB at `path`.
///
/// Parent directories are created as needed. Fails with
/// [`Error::DiskExists`] if `path` exists and `overwrite` is false. On error
/// a partially written file may remain; callers remove it.
pub fn create_raw(
    path: &Path,
    size_mib: u64,
    ssh_public_key: Option<&[u8]>,
    overwrite: bool,
) -> Result<()> {
    if size_mib == 0 {
        return Err(Error::InvalidConfig(format!(
            "disk {}: size must be at least 1 MiB",
            path.display()
        )));
    }
    let Some(len) = size_mib.checked_mul(MIB) else {
        return Err(Error::InvalidConfig(format!(
            "disk {}: size of {size_mib} MiB is too large",
            path.display()
        )));
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::file("create directory", parent))?;
    }

    let mut opts = OpenOptions::new();
    opts.write(true);
    if overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    let mut file = match opts.open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::DiskExists(path.to_owned()));
        }
        Err(e) => return Err(Error::file("create disk", path)(e)),
    };

    if let Some(key) = ssh_public_key {
        file = write_seed(file, key).map_err(Error::file("write disk seed", path))?;
    }
    extend(&mut file, len).map_err(Error::file("extend disk", path))?;

    tracing::debug!(path = %path.display(), size_mib, seeded = ssh_public_key.is_some(), "created disk image");
    Ok(())
}

/// Writes the format marker and SSH key archive at the start of `file`.
fn write_seed(file: File, key: &[u8]) -> io::Result<File> {
    let mut tar = tar::Builder::new(file);

    let mut marker = header(tar::EntryType::Regular, 0o644, FORMAT_MARKER.len());
    tar.append_data(&mut marker, FORMAT_MARKER, FORMAT_MARKER.as_bytes())?;

    let mut dir = header(tar::EntryType::Directory, 0o700, 0);
    tar.append_data(&mut dir, ".ssh", io::empty())?;

    for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
        let mut h = header(tar::EntryType::Regular, 0o644, key.len());
        tar.append_data(&mut h, name, key)?;
    }

    tar.into_inner()
}

/// A ustar header with a fixed epoch mtime so images are reproducible.
fn header(kind: tar::EntryType, mode: u32, size: usize) -> tar::Header {
    let mut h = tar::Header::new_ustar();
    h.set_entry_type(kind);
    h.set_mode(mode);
    h.set_size(size as u64);
    h.set_mtime(0);
    h
}

/// Grows `file` to `len` bytes by writing its last byte, leaving a hole.
fn extend(file: &mut File, len: u64) -> io::Result<()> {
    let end = file.stream_position()?;
    if end < len {
        file.seek(SeekFrom::Start(len - 1))?;
        file.write_all(&[0])?;
    }
    file.sync_all()
}
