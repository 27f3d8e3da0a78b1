//! Release driver: source snapshots and development bundles.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};
use xz2::read::XzDecoder;

use crate::archive::node::join_arcpath;
use crate::archive::{
    ArchiveFileTree, ArchiveFormat, ArchiveTargets, Archiver, NodeInArchive, GIT_HASH_FILENAME,
    MODE_EXECUTABLE, MODE_FILE,
};
use crate::config::{Dependency, DevelVariant, ReleaseInfo};
use crate::error::BuildError;
use crate::process::Executor;
use crate::source::git::{self, GitBackend};
use crate::source::history::parse_commit_time;
use crate::source::{
    external_repo_path_filter, project_path_filter, CannedSource, CollectStrategy, ContentSource,
    PathFilter, SourceCollector, DEFAULT_BATCH_SIZE,
};
use crate::template::TemplateContext;

pub const CHECKSUMS_FILENAME: &str = "SHA256SUMS";
pub const VERSION_FILENAME: &str = "VERSION.txt";
const CHECKSUMS_KEY: &str = "checksums";

/// Commit to release, and whether it came from an unpacked source archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommit {
    pub commit: String,
    pub from_archive: bool,
}

/// Pin `requested` to a full commit id.
///
/// A root holding `.git-hash` is an unpacked source archive; its recorded
/// commit wins over `requested`.
pub fn resolve_commit(executor: &Executor, requested: &str) -> Result<ResolvedCommit> {
    let marker = executor.root().join(GIT_HASH_FILENAME);
    if marker.is_file() {
        let recorded = fs::read_to_string(&marker)
            .with_context(|| format!("reading '{}'", marker.display()))?
            .trim()
            .to_string();
        warn!("{} found: building from a source archive", GIT_HASH_FILENAME);
        if requested != "HEAD" && requested != recorded {
            warn!(requested, recorded = %recorded, "using the commit recorded in the archive");
        }
        return Ok(ResolvedCommit {
            commit: recorded,
            from_archive: true,
        });
    }
    Ok(ResolvedCommit {
        commit: git::rev_parse(executor, requested)?,
        from_archive: false,
    })
}

/// Refuse to release from a working tree with stray files unless `force`.
pub fn check_clean_tree(executor: &Executor, force: bool) -> Result<()> {
    let dirty = git::dirty_files(executor)?;
    if dirty.is_empty() {
        return Ok(());
    }
    for line in &dirty {
        warn!("dirty: {line}");
    }
    if !force {
        bail!(
            "the repository has {} modified or untracked files (use --force to ignore)",
            dirty.len()
        );
    }
    warn!("the tree is dirty, do not publish these artifacts");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReleaseOptions {
    pub root: PathBuf,
    pub dist: PathBuf,
    pub deps: PathBuf,
    pub commit: String,
    pub strategy: CollectStrategy,
    pub batch_size: usize,
}

impl ReleaseOptions {
    pub fn new(root: impl Into<PathBuf>, dist: impl Into<PathBuf>, commit: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            deps: root.join("deps"),
            root,
            dist: dist.into(),
            commit: commit.into(),
            strategy: CollectStrategy::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

pub struct Releaser {
    info: ReleaseInfo,
    version: String,
    options: ReleaseOptions,
    executor: Executor,
    artifacts: BTreeMap<String, PathBuf>,
}

impl Releaser {
    pub fn new(info: ReleaseInfo, options: ReleaseOptions, executor: Executor) -> Result<Self> {
        let version = info.extract_version(&options.root)?;
        Ok(Self {
            info,
            version,
            options,
            executor,
            artifacts: BTreeMap::new(),
        })
    }

    pub fn project(&self) -> &str {
        &self.info.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn commit(&self) -> &str {
        &self.options.commit
    }

    /// Produced files by artifact key.
    pub fn artifacts(&self) -> &BTreeMap<String, PathBuf> {
        &self.artifacts
    }

    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.options.dist)
            .with_context(|| format!("creating '{}'", self.options.dist.display()))
    }

    fn archive_base(&self) -> String {
        format!("{}-{}", self.info.name, self.version)
    }

    fn content_source(&self, repo: &Path) -> Result<Box<dyn ContentSource>> {
        if self.executor.is_dry() {
            return Ok(Box::new(CannedSource::dry_run()?));
        }
        Ok(Box::new(GitBackend::new(Executor::new(repo, false))))
    }

    fn collect_into(
        &self,
        tree: &mut ArchiveFileTree,
        repo: &Path,
        commit: &str,
        filter: PathFilter,
        base: &str,
    ) -> Result<Option<OffsetDateTime>> {
        SourceCollector::new(self.content_source(repo)?, commit)
            .filter(filter)
            .strategy(self.options.strategy)
            .batch_size(self.options.batch_size)
            .add_to_tree(tree, base)
    }

    fn base_context(&self) -> Result<TemplateContext> {
        Ok(TemplateContext::new()
            .with("PROJECT", self.info.name.as_str())
            .with("PROJECT_VERSION", self.version.as_str())
            .with("PROJECT_COMMIT", self.options.commit.as_str())
            .with(
                "PROJECT_REVISION",
                git::describe(&self.executor, &self.options.commit)?,
            )
            .with("PROJECT_ROOT", self.options.root.display().to_string()))
    }

    fn verify_checks<'a>(
        &self,
        added: &BTreeSet<String>,
        required: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for path in required {
            if added.contains(path) {
                continue;
            }
            if self.executor.is_dry() {
                warn!(path, "required file missing (dry run)");
                continue;
            }
            return Err(BuildError::MissingRequiredFile(path.to_string()).into());
        }
        Ok(())
    }

    fn record(&mut self, prefix: &str, targets: &ArchiveTargets) -> Vec<PathBuf> {
        let mut produced = Vec::new();
        for (format, path) in targets.paths() {
            self.artifacts
                .insert(format!("{prefix}-{}", format.extension()), path.to_path_buf());
            produced.push(path.to_path_buf());
        }
        produced
    }

    /// `<name>-<version>.{zip,tar.gz,tar.xz}` from the commit's tracked tree.
    pub fn create_source_archives(&mut self) -> Result<Vec<PathBuf>> {
        let base = self.archive_base();
        let mut tree = ArchiveFileTree::new();
        self.collect_into(
            &mut tree,
            &self.options.root,
            &self.options.commit,
            project_path_filter,
            "",
        )?;

        for extra in &self.info.source.extra_repos {
            let repo = self.options.root.join(extra);
            if !self.executor.is_dry() && !repo.join(".git").exists() {
                bail!("'{}' must be a git repository", repo.display());
            }
            let commit = git::head_of(&self.executor, &repo)?;
            let dest = extra.to_string_lossy().replace('\\', "/");
            info!(repo = %repo.display(), commit = %commit, "adding nested repository");
            self.collect_into(&mut tree, &repo, &commit, external_repo_path_filter, &dest)?;
        }

        let latest = tree
            .latest_timestamp()
            .context("the source tree is empty")?;
        tree.add_file(NodeInArchive::from_text(
            VERSION_FILENAME,
            &format!("{}\n", self.version),
            latest,
        )?);
        if !self.info.source.files.is_empty() {
            let ctx = self.base_context()?;
            tree.add_file_mapping("", &self.info.source.files, &self.options.root, &ctx, latest)?;
        }

        let targets = ArchiveTargets::in_dir(&self.options.dist, &base, &ArchiveFormat::ALL);
        let mut archiver = Archiver::open(&targets)?;
        tree.materialize(&mut archiver, &base)?;
        archiver.add_git_hash(&self.options.commit, &base, latest)?;
        let added = archiver.close()?;

        let required: Vec<String> = self
            .info
            .source
            .checks
            .iter()
            .map(|check| join_arcpath(&base, check))
            .collect();
        self.verify_checks(&added, required.iter().map(String::as_str))?;
        Ok(self.record("source", &targets))
    }

    /// The development bundle described by `devel.<variant>`.
    pub fn create_devel_archive(&mut self, variant: &str) -> Result<Vec<PathBuf>> {
        let devel: DevelVariant = self
            .info
            .devel
            .get(variant)
            .with_context(|| format!("no devel variant named '{variant}'"))?
            .clone();
        let time = parse_commit_time(&git::commit_time(&self.executor, &self.options.commit)?)?;
        let base = self.archive_base();
        let base_ctx = self.base_context()?;
        let stem = base_ctx.configure_path(&devel.archive)?;

        let contexts: Vec<TemplateContext> = if devel.archs.is_empty() {
            vec![base_ctx.clone()]
        } else {
            devel
                .archs
                .iter()
                .map(|(arch, tokens)| {
                    let mut ctx = base_ctx.clone().with("ARCH", arch.as_str());
                    ctx.extend(tokens);
                    ctx
                })
                .collect()
        };

        let mut tree = ArchiveFileTree::new();
        for ctx in &contexts {
            if let Some(install) = &devel.install_tree {
                let src = self.options.root.join(ctx.configure_path(&install.src)?);
                let dst = ctx.configure_path(&install.dst)?;
                if src.is_dir() {
                    tree.add_directory_tree(&dst, &src, time)?;
                } else if self.executor.is_dry() {
                    warn!(path = %src.display(), "install tree missing (dry run)");
                } else {
                    bail!("install tree '{}' does not exist", src.display());
                }
            }
            for (name, dependency) in &devel.dependencies {
                self.merge_dependency(&mut tree, name, dependency, ctx, time)?;
            }
            tree.add_file_mapping("", &devel.files, &self.options.root, ctx, time)?;
        }

        let targets = ArchiveTargets::in_dir(&self.options.dist, &stem, &devel.formats);
        let mut archiver = Archiver::open(&targets)?;
        tree.materialize(&mut archiver, &base)?;
        archiver.add_git_hash(&self.options.commit, &base, time)?;
        let added = archiver.close()?;

        let mut required = Vec::new();
        for ctx in &contexts {
            for check in &devel.checks {
                required.push(join_arcpath(&base, &ctx.configure_path(check)?));
            }
        }
        required.sort();
        required.dedup();
        self.verify_checks(&added, required.iter().map(String::as_str))?;
        Ok(self.record(&format!("devel-{variant}"), &targets))
    }

    fn merge_dependency(
        &self,
        tree: &mut ArchiveFileTree,
        name: &str,
        dependency: &Dependency,
        ctx: &TemplateContext,
        time: OffsetDateTime,
    ) -> Result<()> {
        let pattern = ctx.configure_path(&dependency.artifact)?;
        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&self.options.deps.to_string_lossy()),
            pattern
        );
        let matches = glob::glob(&full)
            .with_context(|| format!("invalid artifact glob '{pattern}'"))?;
        let artifact = &single_artifact(matches, &self.options.deps, name, &pattern)?;

        let mut rules = Vec::with_capacity(dependency.copy.len());
        for rule in &dependency.copy {
            let src = ctx.configure_path(&rule.src)?;
            let src = glob::Pattern::new(&src).map_err(|e| BuildError::InvalidMapping {
                rule: rule.src.clone(),
                reason: e.to_string(),
            })?;
            rules.push((src, ctx.configure_path(&rule.dst)?));
        }

        let mut copied = 0;
        for member in read_archive_members(artifact)? {
            let Some((_, dst)) = rules.iter().find(|(src, _)| src.matches(&member.path)) else {
                continue;
            };
            let file_name = member.path.rsplit('/').next().unwrap_or(&member.path);
            tree.add_file(NodeInArchive::from_data(
                &join_arcpath(dst, file_name),
                member.data,
                member.mode,
                time,
            )?);
            copied += 1;
        }
        if copied == 0 {
            bail!(
                "dependency '{}' ({}) contributed no files",
                name,
                artifact.display()
            );
        }
        info!(dependency = name, artifact = %artifact.display(), files = copied, "merged dependency");
        Ok(())
    }

    /// `SHA256SUMS` over every artifact produced so far.
    pub fn write_checksums(&mut self) -> Result<PathBuf> {
        let mut lines = Vec::new();
        for (key, path) in &self.artifacts {
            if key == CHECKSUMS_KEY {
                continue;
            }
            let name = path
                .file_name()
                .with_context(|| format!("'{}' has no file name", path.display()))?
                .to_string_lossy()
                .into_owned();
            lines.push(format!("{}  {}", sha256_file(path)?, name));
        }
        lines.sort_by(|a, b| a[66..].cmp(&b[66..]));

        let out = self.options.dist.join(CHECKSUMS_FILENAME);
        let mut file =
            File::create(&out).with_context(|| format!("creating '{}'", out.display()))?;
        for line in &lines {
            writeln!(file, "{line}").with_context(|| format!("writing '{}'", out.display()))?;
        }
        self.artifacts.insert(CHECKSUMS_KEY.to_string(), out.clone());
        Ok(out)
    }
}

/// The one archive a dependency glob matched. Unreadable entries fail
/// instead of being skipped, since they could hide a second match.
fn single_artifact<E>(
    matches: impl IntoIterator<Item = std::result::Result<PathBuf, E>>,
    deps: &Path,
    name: &str,
    pattern: &str,
) -> Result<PathBuf>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let matches = matches
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| {
            format!(
                "searching '{}' for dependency '{}' ({})",
                deps.display(),
                name,
                pattern
            )
        })?;
    match <[PathBuf; 1]>::try_from(matches) {
        Ok([artifact]) => Ok(artifact),
        Err(matches) => bail!(
            "exactly one archive in '{}' must match dependency '{}' ({}), found {}",
            deps.display(),
            name,
            pattern,
            matches.len()
        ),
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let mut file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hashing '{}'", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// A regular file inside a dependency archive.
#[derive(Debug)]
struct Member {
    /// Path without its first component.
    path: String,
    data: Vec<u8>,
    mode: u32,
}

fn strip_first_component(path: &str) -> Option<String> {
    let (_, rest) = path.trim_start_matches("./").split_once('/')?;
    (!rest.is_empty()).then(|| rest.to_string())
}

fn member_mode(mode: u32) -> u32 {
    if mode & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

fn read_archive_members(path: &Path) -> Result<Vec<Member>> {
    let name = path.to_string_lossy();
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    if name.ends_with(".zip") {
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("reading zip '{}'", path.display()))?;
        let mut members = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let Some(stripped) = strip_first_component(entry.name()) else {
                continue;
            };
            let mode = member_mode(entry.unix_mode().unwrap_or(0o644));
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("reading '{}' from '{}'", entry.name(), path.display()))?;
            members.push(Member {
                path: stripped,
                data,
                mode,
            });
        }
        return Ok(members);
    }
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        return read_tar_members(tar::Archive::new(GzDecoder::new(file)), path);
    }
    if name.ends_with(".tar.xz") {
        return read_tar_members(tar::Archive::new(XzDecoder::new(file)), path);
    }
    bail!("unsupported dependency archive '{}'", path.display())
}

fn read_tar_members<R: Read>(mut archive: tar::Archive<R>, path: &Path) -> Result<Vec<Member>> {
    let mut members = Vec::new();
    for entry in archive
        .entries()
        .with_context(|| format!("reading tar '{}'", path.display()))?
    {
        let mut entry = entry.with_context(|| format!("reading tar '{}'", path.display()))?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let member = entry.path()?.to_string_lossy().into_owned();
        let Some(stripped) = strip_first_component(&member) else {
            continue;
        };
        let mode = member_mode(entry.header().mode()?);
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("reading '{}' from '{}'", member, path.display()))?;
        members.push(Member {
            path: stripped,
            data,
            mode,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    const RELEASE_INFO: &str = r#"{
        "name": "demo",
        "version": {
            "file": "include/version.h",
            "re_major": "^#define DEMO_MAJOR\\s+([0-9]+)$",
            "re_minor": "^#define DEMO_MINOR\\s+([0-9]+)$",
            "re_micro": "^#define DEMO_MICRO\\s+([0-9]+)$"
        },
        "source": { "checks": ["CMakeLists.txt", "VERSION.txt"] },
        "devel": {
            "mingw": {
                "archive": "@PROJECT@-devel-@PROJECT_VERSION@-mingw",
                "formats": ["zip", "tar.xz"],
                "archs": {
                    "x86": { "TRIPLET": "i686-w64-mingw32" },
                    "x64": { "TRIPLET": "x86_64-w64-mingw32" }
                },
                "install_tree": { "src": "build/install-@TRIPLET@", "dst": "@TRIPLET@" },
                "files": {
                    "": ["LICENSE.txt", "cmake/demo-config.cmake.in:demo-config.cmake"]
                },
                "dependencies": {
                    "zlib": {
                        "artifact": "zlib-*-mingw.zip",
                        "copy": [{ "src": "@TRIPLET@/bin/*.dll", "dst": "@TRIPLET@/bin" }]
                    }
                },
                "checks": ["@TRIPLET@/bin/demo.dll", "@TRIPLET@/bin/zlib1.dll", "demo-config.cmake"]
            }
        }
    }"#;

    fn project() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let write = |rel: &str, text: &str| {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        };
        write(
            "include/version.h",
            "#define DEMO_MAJOR 1\n#define DEMO_MINOR 4\n#define DEMO_MICRO 2\n",
        );
        write("release-info.json", RELEASE_INFO);
        write("LICENSE.txt", "license\n");
        write(
            "cmake/demo-config.cmake.in",
            "set(DEMO_VERSION @PROJECT_VERSION@)\n",
        );
        for triplet in ["i686-w64-mingw32", "x86_64-w64-mingw32"] {
            write(&format!("build/install-{triplet}/bin/demo.dll"), triplet);
            write(&format!("build/install-{triplet}/include/demo.h"), "h");
        }

        let deps = root.join("deps");
        fs::create_dir_all(&deps).unwrap();
        let mut zip = zip::ZipWriter::new(File::create(deps.join("zlib-1.3-mingw.zip")).unwrap());
        for triplet in ["i686-w64-mingw32", "x86_64-w64-mingw32"] {
            zip.start_file(
                format!("zlib-1.3/{triplet}/bin/zlib1.dll"),
                SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(b"zlib").unwrap();
            zip.start_file(
                format!("zlib-1.3/{triplet}/include/zlib.h"),
                SimpleFileOptions::default(),
            )
            .unwrap();
            zip.write_all(b"h").unwrap();
        }
        zip.finish().unwrap();
        temp
    }

    fn releaser(root: &Path, dist: &Path) -> Releaser {
        let info = ReleaseInfo::load(&root.join("release-info.json")).unwrap();
        let options = ReleaseOptions::new(root, dist, git::DRY_COMMIT);
        Releaser::new(info, options, Executor::new(root, true)).unwrap()
    }

    fn zip_names(path: &Path) -> BTreeSet<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(String::from).collect()
    }

    #[test]
    fn test_dry_source_archives() {
        let root = project();
        let dist = TempDir::new().unwrap();
        let mut releaser = releaser(root.path(), dist.path());
        assert_eq!(releaser.version(), "1.4.2");

        let produced = releaser.create_source_archives().unwrap();
        assert_eq!(produced.len(), 3);
        let names = zip_names(&dist.path().join("demo-1.4.2.zip"));
        assert!(names.contains("demo-1.4.2/CMakeLists.txt"));
        assert!(names.contains("demo-1.4.2/VERSION.txt"));
        assert!(names.contains("demo-1.4.2/.git-hash"));
        assert!(names.contains("demo-1.4.2/.gitmodules"));
        assert!(!names.iter().any(|n| n.starts_with("demo-1.4.2/.github")));
    }

    #[test]
    fn test_dry_devel_archive() {
        let root = project();
        let dist = TempDir::new().unwrap();
        let mut releaser = releaser(root.path(), dist.path());

        let produced = releaser.create_devel_archive("mingw").unwrap();
        assert_eq!(
            produced,
            vec![
                dist.path().join("demo-devel-1.4.2-mingw.zip"),
                dist.path().join("demo-devel-1.4.2-mingw.tar.xz"),
            ]
        );
        let names = zip_names(&produced[0]);
        for expected in [
            "demo-1.4.2/LICENSE.txt",
            "demo-1.4.2/demo-config.cmake",
            "demo-1.4.2/i686-w64-mingw32/bin/demo.dll",
            "demo-1.4.2/x86_64-w64-mingw32/bin/zlib1.dll",
            "demo-1.4.2/x86_64-w64-mingw32/include/demo.h",
            "demo-1.4.2/.git-hash",
        ] {
            assert!(names.contains(expected), "missing {expected}: {names:?}");
        }
        assert!(!names.iter().any(|n| n.ends_with("zlib.h")));

        let mut archive = zip::ZipArchive::new(File::open(&produced[0]).unwrap()).unwrap();
        let mut config = String::new();
        archive
            .by_name("demo-1.4.2/demo-config.cmake")
            .unwrap()
            .read_to_string(&mut config)
            .unwrap();
        assert_eq!(config, "set(DEMO_VERSION 1.4.2)\n");
    }

    #[test]
    fn test_ambiguous_dependency_is_rejected() {
        let root = project();
        fs::copy(
            root.path().join("deps/zlib-1.3-mingw.zip"),
            root.path().join("deps/zlib-1.4-mingw.zip"),
        )
        .unwrap();
        let dist = TempDir::new().unwrap();
        let mut releaser = releaser(root.path(), dist.path());
        let err = releaser.create_devel_archive("mingw").unwrap_err();
        assert!(err.to_string().contains("exactly one archive"), "{err:#}");
    }

    #[test]
    fn test_unreadable_glob_entry_is_not_skipped() {
        let deps = Path::new("deps");
        let found = vec![
            Ok(PathBuf::from("deps/zlib-1.3-mingw.zip")),
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "deps/locked")),
        ];
        let err = single_artifact(found, deps, "zlib", "zlib-*-mingw.zip").unwrap_err();
        assert!(err.to_string().contains("searching 'deps'"), "{err:#}");
        assert!(err.root_cause().to_string().contains("deps/locked"));

        let one: Vec<Result<PathBuf, io::Error>> = vec![Ok(PathBuf::from("deps/z.zip"))];
        assert_eq!(
            single_artifact(one, deps, "zlib", "*.zip").unwrap(),
            PathBuf::from("deps/z.zip")
        );
        let none: Vec<Result<PathBuf, io::Error>> = Vec::new();
        assert!(single_artifact(none, deps, "zlib", "*.zip").is_err());
    }

    #[test]
    fn test_lowercase_token_in_archive_name_is_unknown() {
        let root = project();
        let info = fs::read_to_string(root.path().join("release-info.json")).unwrap();
        fs::write(
            root.path().join("release-info.json"),
            info.replace("@PROJECT@-devel-", "@project@-devel-"),
        )
        .unwrap();
        let dist = TempDir::new().unwrap();
        let err = releaser(root.path(), dist.path())
            .create_devel_archive("mingw")
            .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::UnknownToken { token, .. }) => assert_eq!(token, "project"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fs::read_dir(dist.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_variant() {
        let root = project();
        let dist = TempDir::new().unwrap();
        assert!(releaser(root.path(), dist.path())
            .create_devel_archive("msvc")
            .is_err());
    }

    #[test]
    fn test_checksums_cover_artifacts() {
        let root = project();
        let dist = TempDir::new().unwrap();
        let mut releaser = releaser(root.path(), dist.path());
        releaser.create_source_archives().unwrap();
        let sums = fs::read_to_string(releaser.write_checksums().unwrap()).unwrap();
        let names: Vec<&str> = sums.lines().map(|l| &l[66..]).collect();
        assert_eq!(names, vec!["demo-1.4.2.tar.gz", "demo-1.4.2.tar.xz", "demo-1.4.2.zip"]);
        let expected = sha256_file(&dist.path().join("demo-1.4.2.zip")).unwrap();
        assert!(sums.contains(&format!("{expected}  demo-1.4.2.zip")));
    }

    #[test]
    fn test_resolve_commit_prefers_archive_marker() {
        let root = TempDir::new().unwrap();
        let executor = Executor::new(root.path(), true);
        assert_eq!(
            resolve_commit(&executor, "HEAD").unwrap(),
            ResolvedCommit {
                commit: git::DRY_COMMIT.to_string(),
                from_archive: false
            }
        );
        fs::write(root.path().join(GIT_HASH_FILENAME), "abc123\n").unwrap();
        let resolved = resolve_commit(&executor, "v1.0").unwrap();
        assert_eq!(resolved.commit, "abc123");
        assert!(resolved.from_archive);
    }

    #[test]
    fn test_strip_first_component() {
        assert_eq!(strip_first_component("zlib-1.3/x64/bin/z.dll").as_deref(), Some("x64/bin/z.dll"));
        assert_eq!(strip_first_component("./zlib-1.3/README").as_deref(), Some("README"));
        assert_eq!(strip_first_component("toplevel"), None);
        assert_eq!(strip_first_component("dir/"), None);
    }

    #[test]
    fn test_clean_tree_check_in_dry_run() {
        let executor = Executor::new("/nonexistent", true);
        check_clean_tree(&executor, false).unwrap();
    }
}
