use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use release_builder::process::Executor;
use release_builder::release::{check_clean_tree, resolve_commit, ReleaseOptions, Releaser};
use release_builder::source::{CollectStrategy, DEFAULT_BATCH_SIZE};
use release_builder::ReleaseInfo;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum Action {
    /// Source snapshots in every format.
    Source,
    /// Development bundles of pre-built outputs.
    Devel,
}

/// Build reproducible source and development archives for a release.
#[derive(Debug, Parser)]
#[command(name = "release-builder", version)]
struct Args {
    /// Project root (a git checkout or an unpacked source archive).
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Release description; defaults to `<root>/release-info.json`.
    #[arg(long)]
    release_info: Option<PathBuf>,

    /// Output directory; defaults to `<root>/dist`.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Folder holding pre-built dependency archives; defaults to `<root>/deps`.
    #[arg(long)]
    dependency_folder: Option<PathBuf>,

    /// Commit to release.
    #[arg(long, default_value = "HEAD")]
    commit: String,

    #[arg(long, value_enum, num_args = 1.., required = true)]
    actions: Vec<Action>,

    /// Devel variant to build (repeatable; default all).
    #[arg(long = "variant")]
    variants: Vec<String>,

    #[arg(long, value_enum, default_value_t = CollectStrategy::BulkExport)]
    strategy: CollectStrategy,

    /// Objects per request with `--strategy batch`.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Log commands instead of running them; outputs land in `<out>/dry`.
    #[arg(long)]
    dry_run: bool,

    /// Release from a dirty working tree.
    #[arg(long)]
    force: bool,

    #[arg(long)]
    debug: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let root = args.root.clone();
    let release_info = args
        .release_info
        .clone()
        .unwrap_or_else(|| root.join("release-info.json"));
    let info = ReleaseInfo::load(&release_info)?;

    let executor = Executor::new(&root, args.dry_run);
    let resolved = resolve_commit(&executor, &args.commit)
        .with_context(|| format!("resolving commit '{}'", args.commit))?;
    if resolved.from_archive {
        if args.actions.contains(&Action::Source) {
            bail!("cannot create source archives from a source archive");
        }
    } else {
        check_clean_tree(&executor, args.force)?;
    }

    let mut out = args.out.clone().unwrap_or_else(|| root.join("dist"));
    if args.dry_run {
        out = out.join("dry");
    }

    let variants: Vec<String> = if args.variants.is_empty() {
        info.devel.keys().cloned().collect()
    } else {
        args.variants.clone()
    };

    let mut options = ReleaseOptions::new(&root, &out, resolved.commit);
    if let Some(deps) = &args.dependency_folder {
        options.deps = deps.clone();
    }
    options.strategy = args.strategy;
    options.batch_size = args.batch_size;

    let mut releaser = Releaser::new(info, options, executor)?;
    releaser.prepare()?;
    println!(
        "[release] {} {} at {}",
        releaser.project(),
        releaser.version(),
        releaser.commit()
    );

    let mut actions = args.actions.clone();
    actions.sort();
    actions.dedup();
    for action in actions {
        match action {
            Action::Source => {
                println!("[source] collecting with {:?}", args.strategy);
                releaser.create_source_archives()?;
            }
            Action::Devel => {
                if variants.is_empty() {
                    bail!("'{}' defines no devel variants", release_info.display());
                }
                for variant in &variants {
                    println!("[devel:{variant}] building");
                    releaser
                        .create_devel_archive(variant)
                        .with_context(|| format!("building devel variant '{variant}'"))?;
                }
            }
        }
    }

    releaser.write_checksums()?;
    for (key, path) in releaser.artifacts() {
        println!("[release] {key}: {}", path.display());
    }
    Ok(())
}
