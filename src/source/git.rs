//! Git implementation of [`ContentSource`].

use anyhow::{anyhow, bail, Context, Result};
use std::io::BufReader;
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout};
use std::thread;
use tracing::{debug, warn};

use super::batch;
use super::history::{parse_name_status_log, CommitTouch};
use super::{ContentSource, TreeEntry, TreeEntryKind};
use crate::process::{Cmd, Executor};

/// Stand-in answers for dry runs.
pub const DRY_COMMIT: &str = "e5812a9fd2cda317b503325a702ba3c1c37861d9";
pub const DRY_COMMIT_TIME: &str = "2024-03-14T15:40:25-07:00";
const DRY_LOG: &str = "time=2024-03-14T15:40:25-07:00\n\nM\tCMakeLists.txt\n";

fn git() -> Cmd {
    Cmd::new("git")
}

/// Full object id of `rev`.
pub fn rev_parse(executor: &Executor, rev: &str) -> Result<String> {
    let out = executor.check_output(
        git().args(["rev-parse", "--verify"]).arg(format!("{rev}^{{commit}}")),
        DRY_COMMIT,
    )?;
    Ok(out.trim().to_string())
}

/// `rev-parse HEAD` inside another repository.
pub fn head_of(executor: &Executor, repo: &Path) -> Result<String> {
    let out = executor.check_output(
        git().args(["rev-parse", "HEAD"]).current_dir(repo),
        &format!("gitsha-extra-repo-{}", repo.display()),
    )?;
    Ok(out.trim().to_string())
}

/// Committer time of `commit`, ISO-8601.
pub fn commit_time(executor: &Executor, commit: &str) -> Result<String> {
    let out = executor.check_output(
        git().args(["show", "-s", "--format=%cI", commit]),
        DRY_COMMIT_TIME,
    )?;
    Ok(out.trim().to_string())
}

/// Human readable revision, `<tag>-<n>-g<hash>` or a bare hash.
pub fn describe(executor: &Executor, commit: &str) -> Result<String> {
    let short: String = commit.chars().take(10).collect();
    let out = executor.check_output(
        git().args(["describe", "--always", "--tags", "--long", commit]),
        &format!("dry-0-g{short}"),
    )?;
    Ok(out.trim().to_string())
}

/// Untracked, ignored or modified files in the working tree.
pub fn dirty_files(executor: &Executor) -> Result<Vec<String>> {
    let out = executor.check_output(git().args(["status", "--ignored", "--porcelain"]), "\n")?;
    Ok(out
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(String::from)
        .collect())
}

/// Parse `git ls-tree -r -z --full-tree` output.
pub fn parse_ls_tree(raw: &[u8]) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    for record in raw.split(|b| *b == 0).filter(|r| !r.is_empty()) {
        let record = std::str::from_utf8(record).context("tree listing is not UTF-8")?;
        let (meta, path) = record
            .split_once('\t')
            .with_context(|| format!("malformed tree record '{record}'"))?;
        let fields: Vec<&str> = meta.split(' ').collect();
        let [mode, kind, object] = fields.as_slice() else {
            bail!("malformed tree record '{record}'");
        };
        let mode = u32::from_str_radix(mode, 8)
            .with_context(|| format!("bad mode in tree record '{record}'"))?;
        let kind = match (*kind, mode & 0o170000) {
            ("commit", _) => TreeEntryKind::Submodule,
            ("blob", 0o120000) => TreeEntryKind::Symlink,
            ("blob", _) => TreeEntryKind::Blob,
            (other, _) => bail!("unexpected object type '{other}' for '{path}'"),
        };
        entries.push(TreeEntry {
            path: path.to_string(),
            mode,
            object: object.to_string(),
            kind,
        });
    }
    Ok(entries)
}

/// Long-lived `git cat-file --batch`.
struct CatFile {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CatFile {
    fn spawn(root: &Path) -> Result<Self> {
        let mut child = git()
            .args(["cat-file", "--batch"])
            .current_dir(root)
            .spawn_piped()?;
        let stdin = child.stdin.take().context("capturing cat-file stdin")?;
        let stdout = child.stdout.take().context("capturing cat-file stdout")?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Requests are written from a second thread while this one drains the
    /// responses; a batch larger than the pipe buffers would otherwise stall.
    fn read_batch(&mut self, entries: &[TreeEntry]) -> Result<Vec<Vec<u8>>> {
        let objects: Vec<String> = entries.iter().map(|e| e.object.clone()).collect();
        let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let Self {
            child,
            stdin,
            stdout,
        } = self;

        thread::scope(|scope| {
            let writer = scope.spawn(|| batch::write_requests(stdin, &objects));
            let result = batch::read_responses(stdout, &objects, &paths);
            if result.is_err() {
                // Unblocks a writer stuck on a full pipe.
                let _ = child.kill();
            }
            let written = writer
                .join()
                .map_err(|_| anyhow!("cat-file request writer panicked"))?;
            let contents = result?;
            written?;
            Ok(contents)
        })
    }

    fn close(mut self) -> Result<()> {
        drop(self.stdin);
        let status = self.child.wait().context("waiting for cat-file")?;
        if !status.success() {
            bail!("git cat-file --batch exited with {status}");
        }
        Ok(())
    }
}

/// Reads one repository through the git command line.
pub struct GitBackend {
    executor: Executor,
    cat_file: Option<CatFile>,
}

impl GitBackend {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            cat_file: None,
        }
    }

    /// Stop the batch reader, if one was started.
    pub fn close(&mut self) -> Result<()> {
        match self.cat_file.take() {
            Some(cat_file) => cat_file.close(),
            None => Ok(()),
        }
    }
}

impl Drop for GitBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing batch reader: {e:#}");
        }
    }
}

impl ContentSource for GitBackend {
    fn export_tree(&mut self, commit: &str) -> Result<Vec<u8>> {
        self.executor
            .check_output_bytes(git().args(["archive", "--format=tar", commit]), &[])
    }

    fn list_tree(&mut self, commit: &str) -> Result<Vec<TreeEntry>> {
        let raw = self.executor.check_output_bytes(
            git().args(["ls-tree", "-r", "-z", "--full-tree", commit]),
            &[],
        )?;
        parse_ls_tree(&raw)
    }

    fn read_batch(&mut self, entries: &[TreeEntry]) -> Result<Vec<Vec<u8>>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if self.executor.is_dry() {
            return Ok(vec![Vec::new(); entries.len()]);
        }
        if self.cat_file.is_none() {
            debug!(root = %self.executor.root().display(), "starting git cat-file --batch");
            self.cat_file = Some(CatFile::spawn(self.executor.root())?);
        }
        let cat_file = self
            .cat_file
            .as_mut()
            .context("batch reader is not running")?;
        match cat_file.read_batch(entries) {
            Ok(contents) => Ok(contents),
            Err(e) => {
                // The stream is unusable after a failure; never reuse it.
                if let Some(mut stale) = self.cat_file.take() {
                    let _ = stale.child.kill();
                    let _ = stale.child.wait();
                }
                Err(e)
            }
        }
    }

    fn file_history(&mut self, commit: &str) -> Result<Vec<CommitTouch>> {
        let log = self.executor.check_output(
            git().args(["log", "--name-status", "--pretty=time=%cI", commit]),
            DRY_LOG,
        )?;
        parse_name_status_log(&log)
    }
}
