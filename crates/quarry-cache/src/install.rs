#![forbid(unsafe_code)]

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// How a raw artifact turns into the installed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Directory,
    TarGz,
    Tar,
    /// Anything else is kept verbatim as a single file inside the entry
    /// directory.
    PlainFile,
}

fn classify(raw: &Path) -> ArtifactKind {
    if raw.is_dir() {
        return ArtifactKind::Directory;
    }
    let name = raw
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        ArtifactKind::TarGz
    } else if name.ends_with(".tar") {
        ArtifactKind::Tar
    } else {
        ArtifactKind::PlainFile
    }
}

/// Install a fetched raw artifact at `final_path`, atomically.
///
/// Blocking; callers run it on the blocking pool. The payload is fully
/// materialized in a staging directory under `staging_root` (same
/// filesystem as `final_path`) and published with a single rename, so
/// `final_path` either does not exist or holds a complete artifact.
///
/// Archives are unpacked; a single top-level wrapper directory, the usual
/// shape of IDE and plugin distributions, is stripped so the payload root is
/// the artifact itself. The raw artifact is always deleted, success or not.
///
/// Returns the installed size in bytes, measured before publication.
pub(crate) fn install_artifact(
    raw: &Path,
    staging_root: &Path,
    final_path: &Path,
    cancel: &CancellationToken,
) -> CacheResult<u64> {
    let result = stage_and_publish(raw, staging_root, final_path, cancel);
    // The raw artifact never survives installation; a failed unpack must not
    // leave a half-read archive for the next construction to trip over.
    if raw.is_dir() {
        let _ = fs::remove_dir_all(raw);
    } else {
        let _ = fs::remove_file(raw);
    }
    result
}

fn stage_and_publish(
    raw: &Path,
    staging_root: &Path,
    final_path: &Path,
    cancel: &CancellationToken,
) -> CacheResult<u64> {
    let kind = classify(raw);
    let stage = TempDir::with_prefix_in("install-", staging_root)?;
    let unpacked = stage.path().join("payload");
    fs::create_dir(&unpacked)?;

    match kind {
        ArtifactKind::Directory => {
            fs::rename(raw, unpacked.join(raw.file_name().unwrap_or_default()))?;
        }
        ArtifactKind::TarGz => {
            let file = fs::File::open(raw)?;
            unpack_tar(tar::Archive::new(GzDecoder::new(file)), &unpacked, cancel)?;
        }
        ArtifactKind::Tar => {
            let file = fs::File::open(raw)?;
            unpack_tar(tar::Archive::new(file), &unpacked, cancel)?;
        }
        ArtifactKind::PlainFile => {
            fs::rename(raw, unpacked.join(raw.file_name().unwrap_or_default()))?;
        }
    }

    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }

    let payload = strip_wrapper(&unpacked)?;
    let size = dir_size(&payload)?;

    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(&payload, final_path)?;
    debug!(path = %final_path.display(), size, "artifact installed");
    Ok(size)
}

fn unpack_tar<R: io::Read>(
    mut archive: tar::Archive<R>,
    dest: &Path,
    cancel: &CancellationToken,
) -> CacheResult<()> {
    for entry in archive
        .entries()
        .map_err(|e| CacheError::Corrupt(format!("unreadable archive: {e}")))?
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let mut entry = entry.map_err(|e| CacheError::Corrupt(format!("bad archive entry: {e}")))?;
        entry
            .unpack_in(dest)
            .map_err(|e| CacheError::Corrupt(format!("archive extraction failed: {e}")))?;
    }
    Ok(())
}

/// If the unpacked tree is exactly one directory, that directory is a wrapper
/// (`ideaIU-243.12888.9/...`) and its content is the real payload.
fn strip_wrapper(unpacked: &Path) -> CacheResult<PathBuf> {
    let mut entries = fs::read_dir(unpacked)?;
    let first = match entries.next() {
        Some(e) => e?,
        None => return Ok(unpacked.to_path_buf()),
    };
    if entries.next().is_none() && first.file_type()?.is_dir() {
        Ok(first.path())
    } else {
        Ok(unpacked.to_path_buf())
    }
}

/// Total size in bytes of a file or directory tree. Symlinks are counted by
/// their own metadata, never followed.
pub(crate) fn dir_size(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
