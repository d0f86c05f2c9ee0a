use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::models::Ecosystem;
use crate::parser::ParserRegistry;

/// Directories that hold build output, tool caches or installed packages.
const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".gradle",
    ".mvn",
    ".idea",
    "build",
    "target",
    "dist",
    "out",
];

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIPPED_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Every build file under `root` some parser understands, sorted.
pub fn discover_build_files(root: &Path, registry: &ParserRegistry) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
        .filter(|path| registry.for_path(path).is_some())
        .collect();
    files.sort();
    files
}

/// Ecosystems present among `files`.
pub fn detect_ecosystems(files: &[PathBuf], registry: &ParserRegistry) -> Vec<Ecosystem> {
    let found: BTreeSet<Ecosystem> = files
        .iter()
        .filter_map(|path| registry.for_path(path).map(|p| p.ecosystem()))
        .collect();
    found.into_iter().collect()
}

/// The file named one of `names` closest to the repository root: fewest
/// path components first, then lexicographic.
pub fn root_manifest<'a>(files: &'a [PathBuf], names: &[&str]) -> Option<&'a PathBuf> {
    files
        .iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| names.contains(&n))
                .unwrap_or(false)
        })
        .min_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_discovery_skips_installed_and_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "build.gradle");
        touch(root, "app/build.gradle.kts");
        touch(root, "gradle.properties");
        touch(root, "web/package.json");
        touch(root, "web/node_modules/lodash/package.json");
        touch(root, "service/pom.xml");
        touch(root, "service/target/classes/pom.xml");
        touch(root, "README.md");

        let registry = ParserRegistry::new();
        let files = discover_build_files(root, &registry);
        let rel: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(
            rel,
            vec![
                "app/build.gradle.kts",
                "build.gradle",
                "gradle.properties",
                "service/pom.xml",
                "web/package.json",
            ]
        );

        let ecosystems = detect_ecosystems(&files, &registry);
        assert_eq!(ecosystems, vec![Ecosystem::Gradle, Ecosystem::Maven, Ecosystem::Npm]);
    }

    #[test]
    fn test_root_manifest_is_shallowest() {
        let files = vec![
            PathBuf::from("repo/b/pom.xml"),
            PathBuf::from("repo/pom.xml"),
            PathBuf::from("repo/a/pom.xml"),
        ];
        assert_eq!(
            root_manifest(&files, &["pom.xml"]),
            Some(&PathBuf::from("repo/pom.xml"))
        );
        assert_eq!(root_manifest(&files, &["package.json"]), None);
    }
}
