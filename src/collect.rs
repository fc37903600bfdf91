use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{CollectError, extension_of, normalize_extension};

pub(crate) const DEFAULT_EXTENSIONS: &[&str] =
    &["txt", "md", "pdf", "doc", "docx", "rtf", "epub", "html", "htm"];

pub(crate) fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

/// Where the input files come from.
#[derive(Debug, Clone)]
pub(crate) enum InputSource {
    Directory(PathBuf),
    Files(Vec<PathBuf>),
}

pub(crate) fn collect_files(
    source: &InputSource,
    extensions: &[String],
) -> Result<Vec<PathBuf>, CollectError> {
    match source {
        InputSource::Directory(dir) => collect_from_directory(dir, extensions),
        InputSource::Files(files) => validate_files(files),
    }
}

/// Walks `dir` once per extension, so results are grouped by extension in
/// the order given, each group in filesystem enumeration order.
pub(crate) fn collect_from_directory(
    dir: &Path,
    extensions: &[String],
) -> Result<Vec<PathBuf>, CollectError> {
    if !dir.is_dir() {
        return Err(CollectError::DirectoryNotFound(dir.to_path_buf()));
    }
    let root = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

    let mut seen_exts: Vec<String> = Vec::new();
    let mut files = Vec::new();
    for ext in extensions {
        let ext = normalize_extension(ext);
        if ext.is_empty() || seen_exts.contains(&ext) {
            continue;
        }
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!("skipping unreadable entry under {}: {err}", root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if extension_of(entry.path()) == ext {
                files.push(entry.into_path());
            }
        }
        seen_exts.push(ext);
    }
    debug!(count = files.len(), dir = %root.display(), "collected input files");
    Ok(files)
}

pub(crate) fn validate_files(files: &[PathBuf]) -> Result<Vec<PathBuf>, CollectError> {
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        if !file.is_file() {
            return Err(CollectError::FileNotFound(file.clone()));
        }
        out.push(file.canonicalize().unwrap_or_else(|_| file.clone()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn only_supported_extensions_are_returned() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("season1");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("ep1.txt"), "one").unwrap();
        fs::write(nested.join("ep2.txt"), "two").unwrap();
        fs::write(nested.join("notes.md"), "# notes").unwrap();
        fs::write(dir.path().join("ep1.mp3"), "audio").unwrap();
        fs::write(nested.join("cover.jpg"), "img").unwrap();

        let files = collect_from_directory(dir.path(), &default_extensions()).unwrap();
        assert_eq!(files.len(), 3);
        for file in &files {
            assert!(file.is_absolute());
            let ext = extension_of(file);
            assert!(ext == "txt" || ext == "md", "unexpected {}", file.display());
        }
    }

    #[test]
    fn results_are_grouped_by_extension_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        let exts = vec!["md".to_string(), "txt".to_string(), ".md".to_string()];
        let files = collect_from_directory(dir.path(), &exts).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(extension_of(&files[0]), "md");
        assert_eq!(extension_of(&files[1]), "txt");
    }

    #[test]
    fn missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = collect_from_directory(&missing, &default_extensions()).unwrap_err();
        assert!(matches!(err, CollectError::DirectoryNotFound(_)));
    }

    #[test]
    fn explicit_list_is_validated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let files = collect_files(&InputSource::Files(vec![b.clone(), a.clone()]), &[]).unwrap();
        assert_eq!(files, vec![b.canonicalize().unwrap(), a.canonicalize().unwrap()]);

        let missing = dir.path().join("c.txt");
        let err = collect_files(&InputSource::Files(vec![a, missing]), &[]).unwrap_err();
        assert!(matches!(err, CollectError::FileNotFound(_)));
    }
}
