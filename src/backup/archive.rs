// backuptool/src/backup/archive.rs
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tar::{Builder, EntryType, Header};
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use crate::errors::{AppError, Result};

/// Where the bytes of one archive member come from.
#[derive(Debug, Clone)]
pub enum MemberSource {
    /// A file, or a directory added recursively.
    Path(PathBuf),
    /// A bare directory entry with no content.
    EmptyDir,
}

/// One member of an archive: a source mapped to its in-archive name.
#[derive(Debug, Clone)]
pub struct ArchiveMember {
    pub source: MemberSource,
    pub name: String,
}

impl ArchiveMember {
    pub fn path(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: MemberSource::Path(source.into()),
            name: name.into(),
        }
    }

    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self {
            source: MemberSource::EmptyDir,
            name: name.into(),
        }
    }
}

/// Creates a GZipped TAR archive at `output` containing `members` in order.
///
/// The archive is written to a temporary file next to `output` and renamed
/// into place once complete, so a failed run never leaves a truncated
/// archive behind.
pub fn create_archive(output: &Path, members: &[ArchiveMember]) -> Result<PathBuf> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    debug!("Creating tar.gz archive {} ({} members)", output.display(), members.len());

    let staging = NamedTempFile::new_in(&parent)?;
    let enc = GzEncoder::new(staging.reopen()?, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for member in members {
        match &member.source {
            MemberSource::Path(source) if source.is_dir() => {
                tar_builder.append_dir_all(&member.name, source)?;
            }
            MemberSource::Path(source) if source.is_file() => {
                tar_builder.append_path_with_name(source, &member.name)?;
            }
            MemberSource::Path(source) => {
                return Err(AppError::NotFound(format!(
                    "archive member source {} does not exist",
                    source.display()
                )));
            }
            MemberSource::EmptyDir => append_empty_dir(&mut tar_builder, &member.name)?,
        }
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?;

    staging.persist(output).map_err(|e| AppError::Io(e.error))?;

    info!("Tar.gz archive created at {}", output.display());
    Ok(output.to_path_buf())
}

fn append_empty_dir<W: io::Write>(builder: &mut Builder<W>, name: &str) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_path(format!("{}/", name.trim_end_matches('/')))?;
    header.set_size(0);
    header.set_mode(0o755);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append(&header, io::empty())?;
    Ok(())
}

/// Extracts every member of the GZipped TAR `archive` into `dest`, refusing
/// any member that would land outside `dest`.
///
/// Member paths with `..` components or absolute paths are rejected, as are
/// symlinks and hardlinks whose target resolves outside `dest`. Members
/// already written before a violation is found stay on disk; callers must
/// treat a `PathTraversal` error as a corrupt or hostile archive.
pub fn safe_extract(archive: &Path, dest: &Path) -> Result<PathBuf> {
    if !archive.is_file() {
        return Err(AppError::NotFound(format!(
            "archive for extraction is not a file: {}",
            archive.display()
        )));
    }
    fs::create_dir_all(dest)?;
    let dest = dest.canonicalize()?;

    debug!("Extracting {} to {}", archive.display(), dest.display());

    let mut tar_archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    tar_archive.set_overwrite(true);

    for entry in tar_archive.entries()? {
        let mut entry = entry?;
        let member_path = entry.path()?.into_owned();
        let member_name = member_path.display().to_string();

        let Some(relative) = contained_member_path(&member_path) else {
            return Err(traversal(&member_name, &dest));
        };

        let parent = relative.parent().unwrap_or_else(|| Path::new(""));
        let parent_on_disk = resolve_on_disk(&dest.join(parent))?;
        if !parent_on_disk.starts_with(&dest) {
            return Err(traversal(&member_name, &dest));
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let link = entry
                .link_name()?
                .map(|l| l.into_owned())
                .ok_or_else(|| AppError::InvalidArchive(format!("link '{member_name}' has no target")))?;
            // Symlinks resolve from where their parent really is on disk, which
            // may itself be reached through links extracted earlier.
            let base = if entry_type.is_symlink() { &parent_on_disk } else { &dest };
            let contained = match resolve_within(base, &link) {
                Some(target) if target.starts_with(&dest) => resolve_on_disk(&target)?.starts_with(&dest),
                _ => false,
            };
            if !contained {
                return Err(traversal(&member_name, &dest));
            }
        }

        let unpacked = entry.unpack_in(&dest).map_err(|e| {
            if e.to_string().contains("outside of destination") {
                traversal(&member_name, &dest)
            } else {
                AppError::Io(e)
            }
        })?;
        if !unpacked {
            return Err(traversal(&member_name, &dest));
        }
    }

    info!("Archive {} extracted to {}", archive.display(), dest.display());
    Ok(dest)
}

fn traversal(member: &str, dest: &Path) -> AppError {
    error!(
        "Path traversal attempt detected: '{}' would be extracted outside '{}'",
        member,
        dest.display()
    );
    AppError::PathTraversal {
        member: member.to_string(),
        dest: dest.display().to_string(),
    }
}

/// Relative form of a member path, or `None` when it is absolute or uses `..`.
fn contained_member_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Canonical location of `path`, following links through its deepest
/// existing ancestor and appending the components that do not exist yet.
fn resolve_on_disk(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut resolved = existing.canonicalize()?;
    for part in missing.iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Lexically resolves `target` relative to `base` (both inside the
/// extraction root) and returns the result if it never climbs above the root.
fn resolve_within(base: &Path, target: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for component in target.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    /// Writes a raw entry whose name bypasses the tar crate's own path checks.
    fn append_raw<W: io::Write>(
        builder: &mut Builder<W>,
        name: &str,
        entry_type: EntryType,
        link: Option<&str>,
        data: &[u8],
    ) -> io::Result<()> {
        let mut header = Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        if let Some(link) = link {
            header.as_old_mut().linkname[..link.len()].copy_from_slice(link.as_bytes());
        }
        header.set_entry_type(entry_type);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, data)
    }

    fn hostile_archive(
        path: &Path,
        entries: &[(&str, EntryType, Option<&str>, &str)],
    ) -> anyhow::Result<()> {
        let enc = GzEncoder::new(File::create(path)?, Compression::default());
        let mut builder = Builder::new(enc);
        for (name, kind, link, data) in entries {
            append_raw(&mut builder, name, *kind, *link, data.as_bytes())?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }

    #[test]
    fn test_round_trip_preserves_member_bytes() -> anyhow::Result<()> {
        let src = tempdir()?;
        let contents: [(&str, &[u8]); 4] = [
            ("db.dump", b"PGDMP\x00\x01binary"),
            ("uploads.tar.gz", b"\x1f\x8bnested"),
            ("settings.json", b"{\"nome_azienda\": \"ACME\"}"),
            ("manifest.json", b"{\"kind\": \"full\"}"),
        ];
        let mut members = Vec::new();
        for (name, bytes) in contents {
            let p = src.path().join(format!("src_{name}"));
            File::create(&p)?.write_all(bytes)?;
            members.push(ArchiveMember::path(p, name));
        }

        let out_dir = tempdir()?;
        let archive = out_dir.path().join("backup.tar.gz");
        create_archive(&archive, &members)?;

        let dest = tempdir()?;
        let extracted = safe_extract(&archive, dest.path())?;
        for (name, bytes) in contents {
            assert_eq!(fs::read(extracted.join(name))?, bytes, "member {name}");
        }
        Ok(())
    }

    #[test]
    fn test_directories_are_added_recursively_under_member_name() -> anyhow::Result<()> {
        let src = tempdir()?;
        fs::create_dir_all(src.path().join("interventi/2024"))?;
        fs::write(src.path().join("interventi/2024/foto.jpg"), b"jpeg")?;
        fs::write(src.path().join("logo.png"), b"png")?;

        let out = tempdir()?;
        let archive = out.path().join("uploads.tar.gz");
        create_archive(&archive, &[ArchiveMember::path(src.path(), "uploads")])?;

        let dest = tempdir()?;
        safe_extract(&archive, dest.path())?;
        assert_eq!(fs::read(dest.path().join("uploads/interventi/2024/foto.jpg"))?, b"jpeg");
        assert_eq!(fs::read(dest.path().join("uploads/logo.png"))?, b"png");
        Ok(())
    }

    #[test]
    fn test_empty_dir_member_extracts_to_empty_directory() -> anyhow::Result<()> {
        let out = tempdir()?;
        let archive = out.path().join("uploads.tar.gz");
        create_archive(&archive, &[ArchiveMember::empty_dir("uploads")])?;

        let dest = tempdir()?;
        safe_extract(&archive, dest.path())?;
        let uploads = dest.path().join("uploads");
        assert!(uploads.is_dir());
        assert_eq!(fs::read_dir(uploads)?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_source_fails_without_leaving_output() -> anyhow::Result<()> {
        let out = tempdir()?;
        let archive = out.path().join("broken.tar.gz");
        let result = create_archive(&archive, &[ArchiveMember::path(out.path().join("nope"), "x")]);
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(!archive.exists());
        Ok(())
    }

    #[test]
    fn test_parent_dir_member_is_rejected() -> anyhow::Result<()> {
        let root = tempdir()?;
        let archive = root.path().join("evil.tar.gz");
        hostile_archive(&archive, &[("../../evil", EntryType::Regular, None, "pwned")])?;

        let dest = root.path().join("a/b/dest");
        let result = safe_extract(&archive, &dest);
        assert!(matches!(result, Err(AppError::PathTraversal { .. })));
        assert!(!root.path().join("a/evil").exists());
        assert!(!root.path().join("evil").exists());
        Ok(())
    }

    #[test]
    fn test_absolute_member_is_rejected() -> anyhow::Result<()> {
        let root = tempdir()?;
        let archive = root.path().join("abs.tar.gz");
        hostile_archive(&archive, &[("/tmp/evil_abs_member", EntryType::Regular, None, "x")])?;

        let result = safe_extract(&archive, &root.path().join("dest"));
        assert!(matches!(result, Err(AppError::PathTraversal { .. })));
        Ok(())
    }

    #[test]
    fn test_symlink_escaping_destination_is_rejected() -> anyhow::Result<()> {
        let root = tempdir()?;
        let archive = root.path().join("link.tar.gz");
        hostile_archive(
            &archive,
            &[
                ("link", EntryType::Symlink, Some("../outside"), ""),
                ("link/payload", EntryType::Regular, None, "x"),
            ],
        )?;

        let result = safe_extract(&archive, &root.path().join("dest"));
        assert!(matches!(result, Err(AppError::PathTraversal { .. })));
        assert!(!root.path().join("outside/payload").exists());
        Ok(())
    }

    #[test]
    fn test_chained_symlinks_escaping_destination_are_rejected() -> anyhow::Result<()> {
        let root = tempdir()?;
        let archive = root.path().join("chain.tar.gz");
        hostile_archive(
            &archive,
            &[
                ("d", EntryType::Directory, None, ""),
                ("d/sub", EntryType::Symlink, Some(".."), ""),
                ("d/sub/x", EntryType::Symlink, Some("../.."), ""),
                ("x/evil", EntryType::Regular, None, "pwned"),
            ],
        )?;

        let dest = root.path().join("a/b/dest");
        let result = safe_extract(&archive, &dest);
        assert!(matches!(result, Err(AppError::PathTraversal { .. })), "{result:?}");
        assert!(!root.path().join("a/evil").exists());
        assert!(!root.path().join("a/x").exists());
        Ok(())
    }

    #[test]
    fn test_symlink_inside_destination_is_allowed() -> anyhow::Result<()> {
        let root = tempdir()?;
        let archive = root.path().join("ok.tar.gz");
        hostile_archive(
            &archive,
            &[
                ("data/file.txt", EntryType::Regular, None, "hello"),
                ("data/alias", EntryType::Symlink, Some("file.txt"), ""),
            ],
        )?;

        let dest = root.path().join("dest");
        safe_extract(&archive, &dest)?;
        assert_eq!(fs::read(dest.join("data/file.txt"))?, b"hello");
        Ok(())
    }

    #[test]
    fn test_extract_overwrites_existing_files() -> anyhow::Result<()> {
        let src = tempdir()?;
        let file = src.path().join("settings.json");
        fs::write(&file, b"new")?;
        let archive = src.path().join("a.tar.gz");
        create_archive(&archive, &[ArchiveMember::path(&file, "settings.json")])?;

        let dest = tempdir()?;
        fs::write(dest.path().join("settings.json"), b"old")?;
        safe_extract(&archive, dest.path())?;
        assert_eq!(fs::read(dest.path().join("settings.json"))?, b"new");
        Ok(())
    }

    #[test]
    fn test_resolve_within() {
        assert_eq!(resolve_within(Path::new("a"), Path::new("../b")), Some(PathBuf::from("b")));
        assert_eq!(resolve_within(Path::new("a"), Path::new("../../b")), None);
        assert_eq!(resolve_within(Path::new(""), Path::new("/etc/passwd")), None);
    }
}
