use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::backup::UPLOADS_ROOT;
use crate::errors::Result;

/// Directory whose children should become the new uploads: the `uploads/`
/// wrapper when the archive has one, otherwise the extraction root.
pub fn uploads_source(extracted: &Path) -> PathBuf {
    let wrapped = extracted.join(UPLOADS_ROOT);
    if wrapped.is_dir() { wrapped } else { extracted.to_path_buf() }
}

/// Replaces the contents of `live` with the tree under `source`.
///
/// `live` itself is kept since it is often a mount point; only its children
/// are removed.
pub fn replace_directory_contents(source: &Path, live: &Path) -> Result<u64> {
    fs::create_dir_all(live)?;
    for entry in fs::read_dir(live)? {
        let path = entry?.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    let mut copied = 0;
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let dest = live.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_file() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            copied += 1;
        }
    }
    info!("Copied {} file(s) into {}", copied, live.display());
    Ok(copied)
}
