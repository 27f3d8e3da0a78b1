//! One logical archive member.

use anyhow::{bail, Context, Result};
use std::borrow::Cow;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::error::BuildError;

/// Regular, non-executable file.
pub const MODE_FILE: u32 = 0o100644;
/// Regular file with the executable bits set.
pub const MODE_EXECUTABLE: u32 = 0o100755;
/// Symbolic link; tar-like sinks always store symlinks as `0777`.
pub const MODE_SYMLINK: u32 = 0o120777;
pub const MODE_DIRECTORY: u32 = 0o040755;

/// Payload of a node. Exactly one is active per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Content copied byte for byte from a file on disk.
    File(PathBuf),
    /// Content held in memory (generated text, extracted blobs).
    Data(Arc<[u8]>),
    /// Target string, interpreted only at resolution time.
    Symlink(String),
    /// Explicit directory entry without content.
    Directory,
}

/// An immutable entry destined for an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInArchive {
    arcpath: String,
    kind: NodeKind,
    mode: u32,
    time: OffsetDateTime,
}

impl NodeInArchive {
    fn new(arcpath: &str, kind: NodeKind, mode: u32, time: OffsetDateTime) -> Result<Self> {
        Ok(Self {
            arcpath: normalize_arcpath(arcpath)?,
            kind,
            mode,
            time,
        })
    }

    /// File backed by `path` on disk.
    ///
    /// The mode is reduced to [`MODE_FILE`] or [`MODE_EXECUTABLE`] so the
    /// archive does not depend on the umask of the machine that built it.
    pub fn from_fs(arcpath: &str, path: &Path, time: OffsetDateTime) -> Result<Self> {
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("reading metadata of '{}'", path.display()))?;
        if !meta.file_type().is_file() {
            return Err(BuildError::UnsupportedEntry {
                path: path.display().to_string(),
                kind: describe_file_type(&meta),
            }
            .into());
        }
        let mode = if meta.permissions().mode() & 0o111 != 0 {
            MODE_EXECUTABLE
        } else {
            MODE_FILE
        };
        Self::new(arcpath, NodeKind::File(path.to_path_buf()), mode, time)
    }

    /// File backed by bytes held in memory.
    pub fn from_data(
        arcpath: &str,
        data: impl Into<Vec<u8>>,
        mode: u32,
        time: OffsetDateTime,
    ) -> Result<Self> {
        let data: Vec<u8> = data.into();
        Self::new(arcpath, NodeKind::Data(Arc::from(data)), mode, time)
    }

    /// Generated text file with mode [`MODE_FILE`].
    pub fn from_text(arcpath: &str, text: &str, time: OffsetDateTime) -> Result<Self> {
        Self::from_data(arcpath, text.as_bytes(), MODE_FILE, time)
    }

    pub fn symlink(arcpath: &str, target: &str, time: OffsetDateTime) -> Result<Self> {
        if target.is_empty() {
            bail!("symlink '{}' has an empty target", arcpath);
        }
        Self::new(
            arcpath,
            NodeKind::Symlink(target.to_string()),
            MODE_SYMLINK,
            time,
        )
    }

    pub fn directory(arcpath: &str, time: OffsetDateTime) -> Result<Self> {
        Self::new(arcpath, NodeKind::Directory, MODE_DIRECTORY, time)
    }

    pub fn arcpath(&self) -> &str {
        &self.arcpath
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn time(&self) -> OffsetDateTime {
        self.time
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink(_))
    }

    /// Same node placed under `base` (`""` leaves it unchanged).
    pub fn rebased(&self, base: &str) -> Result<Self> {
        self.relocated(&join_arcpath(base, &self.arcpath))
    }

    /// Same payload and metadata under a different archive path.
    pub fn relocated(&self, arcpath: &str) -> Result<Self> {
        Self::new(arcpath, self.kind.clone(), self.mode, self.time)
    }

    /// Content of a file node. Symlinks and directories have none.
    pub fn content(&self) -> Result<Cow<'_, [u8]>> {
        match &self.kind {
            NodeKind::File(path) => {
                let bytes =
                    fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
                Ok(Cow::Owned(bytes))
            }
            NodeKind::Data(data) => Ok(Cow::Borrowed(&data[..])),
            NodeKind::Symlink(_) | NodeKind::Directory => {
                bail!("'{}' has no file content", self.arcpath)
            }
        }
    }
}

/// Join two archive paths with a single `/`, treating `""` as the root.
pub fn join_arcpath(base: &str, rel: &str) -> String {
    let base = base.trim_matches('/');
    let rel = rel.trim_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{rel}"),
    }
}

/// Strip surrounding slashes and reject paths that cannot live in an archive.
pub fn normalize_arcpath(raw: &str) -> Result<String> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        bail!("archive path '{}' is empty", raw);
    }
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            bail!("archive path '{}' has an invalid component '{}'", raw, component);
        }
    }
    Ok(trimmed.to_string())
}

fn describe_file_type(meta: &fs::Metadata) -> String {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        "symlink".to_string()
    } else if file_type.is_dir() {
        "directory".to_string()
    } else {
        "special file".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use time::macros::datetime;

    #[test]
    fn test_arcpath_is_normalized() {
        let t = datetime!(2024-03-14 15:40:25 UTC);
        let node = NodeInArchive::from_text("/pkg/README.txt/", "hi\n", t).unwrap();
        assert_eq!(node.arcpath(), "pkg/README.txt");
        assert!(NodeInArchive::from_text("pkg/../x", "", t).is_err());
        assert!(NodeInArchive::from_text("pkg//x", "", t).is_err());
        assert!(NodeInArchive::from_text("/", "", t).is_err());
    }

    #[test]
    fn test_from_fs_normalizes_mode() {
        let temp = TempDir::new().unwrap();
        let plain = temp.path().join("plain");
        let tool = temp.path().join("tool");
        fs::write(&plain, "a").unwrap();
        fs::write(&tool, "b").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o700)).unwrap();

        let t = datetime!(2024-01-01 0:00 UTC);
        assert_eq!(NodeInArchive::from_fs("plain", &plain, t).unwrap().mode(), MODE_FILE);
        assert_eq!(
            NodeInArchive::from_fs("tool", &tool, t).unwrap().mode(),
            MODE_EXECUTABLE
        );
    }

    #[test]
    fn test_from_fs_rejects_directories_and_symlinks() {
        let temp = TempDir::new().unwrap();
        let t = datetime!(2024-01-01 0:00 UTC);
        std::os::unix::fs::symlink("nowhere", temp.path().join("link")).unwrap();

        let err = NodeInArchive::from_fs("d", temp.path(), t).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::UnsupportedEntry { .. })
        ));
        assert!(NodeInArchive::from_fs("l", &temp.path().join("link"), t).is_err());
    }

    #[test]
    fn test_content_by_kind() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, "on disk").unwrap();
        let t = datetime!(2024-01-01 0:00 UTC);

        let disk = NodeInArchive::from_fs("f", &path, t).unwrap();
        let data = NodeInArchive::from_text("g", "in memory", t).unwrap();
        let link = NodeInArchive::symlink("h", "f", t).unwrap();

        assert_eq!(&*disk.content().unwrap(), b"on disk");
        assert_eq!(&*data.content().unwrap(), b"in memory");
        assert!(link.content().is_err());
        assert_eq!(link.mode(), MODE_SYMLINK);
    }

    #[test]
    fn test_rebased_and_join() {
        let t = datetime!(2024-01-01 0:00 UTC);
        let node = NodeInArchive::from_text("lib/a.so", "", t).unwrap();
        assert_eq!(node.rebased("pkg-1.0").unwrap().arcpath(), "pkg-1.0/lib/a.so");
        assert_eq!(node.rebased("").unwrap().arcpath(), "lib/a.so");
        assert_eq!(join_arcpath("a/", "/b"), "a/b");
        assert_eq!(join_arcpath("", "b"), "b");
    }
}
