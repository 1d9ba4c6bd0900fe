use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Temp sibling used by [`write_atomic`]; same directory so the rename never
/// crosses a filesystem.
pub fn atomic_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string());
    path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

/// Replaces `path` with `contents` so readers observe either the old or the
/// new file, never a partial one.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let tmp = atomic_temp_path(path);
    let result = write_then_rename(&tmp, path, contents, mode);
    if result.is_err() {
        let _ = remove_file_if_exists(&tmp);
    }
    result
}

fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    // mode() only applies on creation; a leftover temp file keeps its old bits
    fs::set_permissions(tmp, fs::Permissions::from_mode(mode))?;
    drop(file);

    fs::rename(tmp, path)?;
    sync_parent_dir(path)
}

pub fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}
