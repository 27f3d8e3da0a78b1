//! Multi-format archive sink.
//!
//! One [`Archiver`] owns up to three writers: a zip file (no symlink
//! representation, so symlinks arrive pre-expanded into real files) and
//! gzip/xz compressed tarballs (symlinks stored as link entries). Every call
//! writes the same entry, with the same mode and timestamp, into every open
//! writer.
//!
//! Outputs are written to `<path>.part` and only renamed into place by
//! [`Archiver::close`], which consumes the archiver.

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::debug;
use xz2::write::XzEncoder;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::node::{join_arcpath, NodeInArchive, NodeKind, MODE_FILE};

/// Name of the marker file recording the commit an archive was built from.
pub const GIT_HASH_FILENAME: &str = ".git-hash";

/// Container formats the archiver can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.xz")]
    TarXz,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 3] = [ArchiveFormat::Zip, ArchiveFormat::TarGz, ArchiveFormat::TarXz];

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarXz => "tar.xz",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Output paths, at most one per format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveTargets {
    pub zip: Option<PathBuf>,
    pub tar_gz: Option<PathBuf>,
    pub tar_xz: Option<PathBuf>,
}

impl ArchiveTargets {
    /// `<dir>/<stem>.<ext>` for each requested format.
    pub fn in_dir(dir: &Path, stem: &str, formats: &[ArchiveFormat]) -> Self {
        let mut targets = Self::default();
        for format in formats {
            let path = dir.join(format!("{stem}.{}", format.extension()));
            match format {
                ArchiveFormat::Zip => targets.zip = Some(path),
                ArchiveFormat::TarGz => targets.tar_gz = Some(path),
                ArchiveFormat::TarXz => targets.tar_xz = Some(path),
            }
        }
        targets
    }

    /// Every configured path, tagged with its format.
    pub fn paths(&self) -> Vec<(ArchiveFormat, &Path)> {
        [
            (ArchiveFormat::Zip, self.zip.as_deref()),
            (ArchiveFormat::TarGz, self.tar_gz.as_deref()),
            (ArchiveFormat::TarXz, self.tar_xz.as_deref()),
        ]
        .into_iter()
        .filter_map(|(format, path)| path.map(|p| (format, p)))
        .collect()
    }
}

/// A file the zip writer receives in place of a symlink.
#[derive(Debug, Clone)]
pub struct ResolvedFile<'a> {
    /// Path the copy takes in the archive.
    pub arcpath: String,
    /// Node providing content and mode.
    pub node: &'a NodeInArchive,
}

struct ZipSink {
    writer: ZipWriter<BufWriter<File>>,
    part: PathBuf,
    path: PathBuf,
}

enum TarEncoder {
    Gz(GzEncoder<BufWriter<File>>),
    Xz(XzEncoder<BufWriter<File>>),
}

impl Write for TarEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarEncoder::Gz(w) => w.write(buf),
            TarEncoder::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarEncoder::Gz(w) => w.flush(),
            TarEncoder::Xz(w) => w.flush(),
        }
    }
}

impl TarEncoder {
    fn finish(self) -> io::Result<BufWriter<File>> {
        match self {
            TarEncoder::Gz(w) => w.finish(),
            TarEncoder::Xz(w) => w.finish(),
        }
    }
}

struct TarSink {
    builder: tar::Builder<TarEncoder>,
    part: PathBuf,
    path: PathBuf,
}

/// Writes identical entries into every open archive.
pub struct Archiver {
    zip: Option<ZipSink>,
    tars: Vec<TarSink>,
    added_paths: BTreeSet<String>,
}

impl Archiver {
    /// Create the `.part` files for every target.
    pub fn open(targets: &ArchiveTargets) -> Result<Self> {
        let mut zip = None;
        let mut tars = Vec::new();
        for (format, path) in targets.paths() {
            let part = part_path(path);
            if let Some(parent) = part.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating output directory '{}'", parent.display()))?;
            }
            let file = File::create(&part)
                .with_context(|| format!("creating archive '{}'", part.display()))?;
            let out = BufWriter::new(file);
            match format {
                ArchiveFormat::Zip => {
                    zip = Some(ZipSink {
                        writer: ZipWriter::new(out),
                        part,
                        path: path.to_path_buf(),
                    });
                }
                ArchiveFormat::TarGz => {
                    // mtime 0 keeps the gzip header reproducible.
                    let encoder = GzBuilder::new().mtime(0).write(out, Compression::best());
                    tars.push(TarSink {
                        builder: tar::Builder::new(TarEncoder::Gz(encoder)),
                        part,
                        path: path.to_path_buf(),
                    });
                }
                ArchiveFormat::TarXz => {
                    tars.push(TarSink {
                        builder: tar::Builder::new(TarEncoder::Xz(XzEncoder::new(out, 6))),
                        part,
                        path: path.to_path_buf(),
                    });
                }
            }
        }
        Ok(Self {
            zip,
            tars,
            added_paths: BTreeSet::new(),
        })
    }

    /// Every archive path written so far.
    pub fn added_paths(&self) -> &BTreeSet<String> {
        &self.added_paths
    }

    /// Write a regular file from memory into every sink.
    pub fn add_file_data(
        &mut self,
        arcpath: &str,
        data: &[u8],
        mode: u32,
        time: OffsetDateTime,
    ) -> Result<()> {
        debug!(arcpath, size = data.len(), "adding file");
        if let Some(zip) = &mut self.zip {
            write_zip_file(zip, arcpath, data, mode, time)?;
        }
        for tar in &mut self.tars {
            let mut header = tar_header(tar::EntryType::Regular, mode, data.len() as u64, time);
            tar.builder
                .append_data(&mut header, arcpath, data)
                .with_context(|| format!("writing '{}' to '{}'", arcpath, tar.part.display()))?;
        }
        self.added_paths.insert(arcpath.to_string());
        Ok(())
    }

    /// Write a regular file read from disk into every sink.
    pub fn add_file_path(&mut self, arcpath: &str, path: &Path, time: OffsetDateTime) -> Result<()> {
        let node = NodeInArchive::from_fs(arcpath, path, time)?;
        let data = node.content()?;
        self.add_file_data(arcpath, &data, node.mode(), time)
    }

    /// Write an explicit directory entry into every sink.
    pub fn add_directory(&mut self, arcpath: &str, mode: u32, time: OffsetDateTime) -> Result<()> {
        debug!(arcpath, "adding directory");
        if let Some(zip) = &mut self.zip {
            let options = zip_options(mode, time);
            zip.writer
                .add_directory(arcpath, options)
                .with_context(|| format!("writing '{}' to '{}'", arcpath, zip.part.display()))?;
        }
        for tar in &mut self.tars {
            let mut header = tar_header(tar::EntryType::Directory, mode, 0, time);
            tar.builder
                .append_data(&mut header, arcpath, io::empty())
                .with_context(|| format!("writing '{}' to '{}'", arcpath, tar.part.display()))?;
        }
        self.added_paths.insert(arcpath.to_string());
        Ok(())
    }

    /// Write a symlink.
    ///
    /// Tarballs get a real link entry; the zip gets `files`, the copies the
    /// caller resolved for it.
    pub fn add_symlink(
        &mut self,
        arcpath: &str,
        target: &str,
        time: OffsetDateTime,
        files: &[ResolvedFile<'_>],
    ) -> Result<()> {
        debug!(arcpath, target, copies = files.len(), "adding symlink");
        if let Some(zip) = &mut self.zip {
            for file in files {
                let data = file.node.content()?;
                write_zip_file(zip, &file.arcpath, &data, file.node.mode(), time)?;
            }
        }
        for tar in &mut self.tars {
            let mut header = tar_header(tar::EntryType::Symlink, 0o777, 0, time);
            tar.builder
                .append_link(&mut header, arcpath, target)
                .with_context(|| format!("writing '{}' to '{}'", arcpath, tar.part.display()))?;
        }
        self.added_paths
            .extend(files.iter().map(|file| file.arcpath.clone()));
        Ok(())
    }

    /// Write a non-symlink node. Symlinks need [`Archiver::add_symlink`].
    pub fn add_node(&mut self, arcpath: &str, node: &NodeInArchive) -> Result<()> {
        match node.kind() {
            NodeKind::File(path) => self.add_file_path(arcpath, path, node.time()),
            NodeKind::Data(data) => self.add_file_data(arcpath, data, node.mode(), node.time()),
            NodeKind::Directory => self.add_directory(arcpath, node.mode(), node.time()),
            NodeKind::Symlink(target) => {
                bail!("symlink '{}' -> '{}' must be resolved before writing", arcpath, target)
            }
        }
    }

    /// Write `.git-hash` (the commit followed by a newline) under `arcdir`.
    pub fn add_git_hash(&mut self, commit: &str, arcdir: &str, time: OffsetDateTime) -> Result<()> {
        let arcpath = join_arcpath(arcdir, GIT_HASH_FILENAME);
        self.add_file_data(&arcpath, format!("{commit}\n").as_bytes(), MODE_FILE, time)
    }

    /// Finish every sink and move the outputs into place.
    ///
    /// Returns the set of written archive paths.
    pub fn close(self) -> Result<BTreeSet<String>> {
        if let Some(zip) = self.zip {
            let out = zip
                .writer
                .finish()
                .with_context(|| format!("finishing '{}'", zip.part.display()))?;
            finish_file(out, &zip.part, &zip.path)?;
        }
        for tar in self.tars {
            let encoder = tar
                .builder
                .into_inner()
                .with_context(|| format!("finishing '{}'", tar.part.display()))?;
            let out = encoder
                .finish()
                .with_context(|| format!("finishing '{}'", tar.part.display()))?;
            finish_file(out, &tar.part, &tar.path)?;
        }
        Ok(self.added_paths)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn finish_file(out: BufWriter<File>, part: &Path, path: &Path) -> Result<()> {
    let file = out
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flushing '{}'", part.display()))?;
    file.sync_all()
        .with_context(|| format!("syncing '{}'", part.display()))?;
    fs::rename(part, path)
        .with_context(|| format!("renaming '{}' -> '{}'", part.display(), path.display()))?;
    Ok(())
}

fn write_zip_file(
    zip: &mut ZipSink,
    arcpath: &str,
    data: &[u8],
    mode: u32,
    time: OffsetDateTime,
) -> Result<()> {
    zip.writer
        .start_file(arcpath, zip_options(mode, time))
        .with_context(|| format!("writing '{}' to '{}'", arcpath, zip.part.display()))?;
    zip.writer
        .write_all(data)
        .with_context(|| format!("writing '{}' to '{}'", arcpath, zip.part.display()))?;
    Ok(())
}

fn zip_options(mode: u32, time: OffsetDateTime) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip_datetime(time))
        .unix_permissions(mode & 0o777)
}

/// Zip stores local wall-clock fields; anything outside 1980..=2107 clamps
/// to the zip epoch.
fn zip_datetime(time: OffsetDateTime) -> zip::DateTime {
    u16::try_from(time.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                u8::from(time.month()),
                time.day(),
                time.hour(),
                time.minute(),
                time.second(),
            )
            .ok()
        })
        .unwrap_or_default()
}

fn tar_header(entry_type: tar::EntryType, mode: u32, size: u64, time: OffsetDateTime) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mode(mode & 0o7777);
    header.set_mtime(u64::try_from(time.unix_timestamp()).unwrap_or(0));
    header.set_uid(0);
    header.set_gid(0);
    header
}
