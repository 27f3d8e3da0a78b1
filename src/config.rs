//! Release description (`release-info.json` or `.toml`).

use anyhow::{bail, Context, Result};
use regex::RegexBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{ArchiveFormat, FileMapping};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseInfo {
    pub name: String,
    pub version: VersionInfo,
    #[serde(default)]
    pub source: SourceInfo,
    /// Development bundles by variant name.
    #[serde(default)]
    pub devel: BTreeMap<String, DevelVariant>,
}

/// Where the version number lives and how to read it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionInfo {
    /// Relative to the project root.
    pub file: PathBuf,
    pub re_major: String,
    pub re_minor: String,
    pub re_micro: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceInfo {
    /// Paths (below the archive base) that must end up in the archive.
    #[serde(default)]
    pub checks: Vec<String>,
    /// Nested repositories bundled at their own `HEAD`.
    #[serde(default, alias = "extra-repos")]
    pub extra_repos: Vec<PathBuf>,
    /// Generated or renamed extras, applied after the tracked tree.
    #[serde(default)]
    pub files: FileMapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevelVariant {
    /// Output file stem, may use tokens (e.g. `@PROJECT@-devel-@PROJECT_VERSION@-mingw`).
    pub archive: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<ArchiveFormat>,
    /// Architecture name -> extra tokens for that architecture.
    #[serde(default)]
    pub archs: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub install_tree: Option<InstallTree>,
    #[serde(default)]
    pub files: FileMapping,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Dependency>,
    #[serde(default)]
    pub checks: Vec<String>,
}

/// A pre-built install prefix imported as a whole.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallTree {
    /// Directory template relative to the project root.
    pub src: String,
    /// Destination directory template below the archive base.
    #[serde(default)]
    pub dst: String,
}

/// A pre-built dependency archive merged into a development bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    /// Glob relative to the dependency folder; must match exactly one file.
    pub artifact: String,
    pub copy: Vec<CopyRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyRule {
    /// Glob matched against member paths without their first component.
    pub src: String,
    /// Destination directory template.
    pub dst: String,
}

fn default_formats() -> Vec<ArchiveFormat> {
    ArchiveFormat::ALL.to_vec()
}

impl ReleaseInfo {
    /// Parse as TOML when the extension says so, JSON otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading release description '{}'", path.display()))?;
        let info: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)
                .with_context(|| format!("parsing release description '{}'", path.display()))?,
            _ => serde_json::from_str(&text)
                .with_context(|| format!("parsing release description '{}'", path.display()))?,
        };
        info.validate()
            .with_context(|| format!("invalid release description '{}'", path.display()))?;
        Ok(info)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("name must not be empty");
        }
        for (variant, devel) in &self.devel {
            if devel.formats.is_empty() {
                bail!("devel variant '{}' has no formats", variant);
            }
            let unique: BTreeSet<_> = devel.formats.iter().collect();
            if unique.len() != devel.formats.len() {
                bail!("devel variant '{}' lists a format twice", variant);
            }
            if devel.archive.trim().is_empty() {
                bail!("devel variant '{}' has an empty archive name", variant);
            }
        }
        Ok(())
    }

    /// `MAJOR.MINOR.MICRO` read from the version file below `root`.
    pub fn extract_version(&self, root: &Path) -> Result<String> {
        let path = root.join(&self.version.file);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading version file '{}'", path.display()))?;
        let part = |pattern: &str| -> Result<String> {
            let re = RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .with_context(|| format!("invalid version pattern '{pattern}'"))?;
            let caps = re
                .captures(&text)
                .with_context(|| format!("'{}' does not match '{}'", pattern, path.display()))?;
            let group = caps
                .get(1)
                .with_context(|| format!("version pattern '{pattern}' has no capture group"))?;
            Ok(group.as_str().to_string())
        };
        Ok(format!(
            "{}.{}.{}",
            part(&self.version.re_major)?,
            part(&self.version.re_minor)?,
            part(&self.version.re_micro)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const JSON: &str = r#"{
        "name": "SDL3",
        "version": {
            "file": "include/SDL3/SDL_version.h",
            "re_major": "^#define SDL_MAJOR_VERSION\\s+([0-9]+)$",
            "re_minor": "^#define SDL_MINOR_VERSION\\s+([0-9]+)$",
            "re_micro": "^#define SDL_MICRO_VERSION\\s+([0-9]+)$"
        },
        "source": {
            "checks": ["include/SDL3/SDL.h"],
            "extra-repos": ["external/zlib"]
        },
        "devel": {
            "mingw": {
                "archive": "@PROJECT@-devel-@PROJECT_VERSION@-mingw",
                "formats": ["zip", "tar.gz"],
                "archs": {
                    "x64": { "TRIPLET": "x86_64-w64-mingw32" }
                },
                "install_tree": { "src": "build-mingw/install-@TRIPLET@", "dst": "@TRIPLET@" },
                "files": { "": ["LICENSE.txt"] },
                "dependencies": {
                    "zlib": {
                        "artifact": "zlib-*-mingw.tar.gz",
                        "copy": [{ "src": "@TRIPLET@/bin/*.dll", "dst": "@TRIPLET@/bin" }]
                    }
                },
                "checks": ["@TRIPLET@/bin/SDL3.dll"]
            }
        }
    }"#;

    const HEADER: &str = "#define SDL_MAJOR_VERSION   3\n\
        #define SDL_MINOR_VERSION   2\n\
        #define SDL_MICRO_VERSION   10\n";

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_json() {
        let temp = TempDir::new().unwrap();
        let info = ReleaseInfo::load(&write(temp.path(), "release-info.json", JSON)).unwrap();
        assert_eq!(info.name, "SDL3");
        assert_eq!(info.source.extra_repos, vec![PathBuf::from("external/zlib")]);
        let mingw = &info.devel["mingw"];
        assert_eq!(mingw.formats, vec![ArchiveFormat::Zip, ArchiveFormat::TarGz]);
        assert_eq!(mingw.archs["x64"]["TRIPLET"], "x86_64-w64-mingw32");
        assert_eq!(mingw.dependencies["zlib"].copy[0].dst, "@TRIPLET@/bin");
    }

    #[test]
    fn test_load_toml_defaults() {
        let temp = TempDir::new().unwrap();
        let toml = r#"
            name = "demo"
            [version]
            file = "VERSION"
            re_major = '^(\d+)\.'
            re_minor = '^\d+\.(\d+)'
            re_micro = '^\d+\.\d+\.(\d+)'
            [devel.vc]
            archive = "demo-devel-@PROJECT_VERSION@-VC"
        "#;
        let info = ReleaseInfo::load(&write(temp.path(), "release-info.toml", toml)).unwrap();
        assert!(info.source.checks.is_empty());
        assert_eq!(info.devel["vc"].formats, ArchiveFormat::ALL.to_vec());

        write(temp.path(), "VERSION", "1.22.333\n");
        assert_eq!(info.extract_version(temp.path()).unwrap(), "1.22.333");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let temp = TempDir::new().unwrap();
        let json = JSON.replace("\"checks\": [\"include", "\"chekcs\": [\"include");
        assert!(ReleaseInfo::load(&write(temp.path(), "r.json", &json)).is_err());
    }

    #[test]
    fn test_extract_version() {
        let temp = TempDir::new().unwrap();
        let info = ReleaseInfo::load(&write(temp.path(), "release-info.json", JSON)).unwrap();
        write(temp.path(), "include/SDL3/SDL_version.h", HEADER);
        assert_eq!(info.extract_version(temp.path()).unwrap(), "3.2.10");
    }

    #[test]
    fn test_extract_version_without_match() {
        let temp = TempDir::new().unwrap();
        let info = ReleaseInfo::load(&write(temp.path(), "release-info.json", JSON)).unwrap();
        write(temp.path(), "include/SDL3/SDL_version.h", "nothing here\n");
        assert!(info.extract_version(temp.path()).is_err());
    }
}
