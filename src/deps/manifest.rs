use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::hashing;

pub const MANIFEST_SUFFIX: &str = ".deps";

/// Store a deps manifest: newline-separated absolute artifact paths under a
/// content-addressed file name. Re-storing the same list reuses the
/// existing file untouched.
pub fn store(dir: &Path, paths: &[PathBuf]) -> std::io::Result<PathBuf> {
    let mut lines = Vec::with_capacity(paths.len());
    for path in paths {
        lines.push(std::path::absolute(path)?.display().to_string());
    }

    let digest = hashing::sha256_hex(lines.iter().map(String::as_str));
    let file = dir.join(format!("{digest}{MANIFEST_SUFFIX}"));
    if file.exists() {
        return Ok(file);
    }

    fs::create_dir_all(dir)?;
    let mut content = lines.join("\n");
    content.push('\n');

    // Concurrent writers produce identical content; the rename keeps the
    // manifest whole either way.
    let tmp = dir.join(format!(".{digest}.{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, content)?;
    fs::rename(&tmp, &file)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_stable_for_equal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![PathBuf::from("/cache/a.jar"), PathBuf::from("/cache/b.jar")];

        let first = store(dir.path(), &paths).unwrap();
        let second = store(dir.path(), &paths).unwrap();
        assert_eq!(first, second);

        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(MANIFEST_SUFFIX));
        assert_eq!(name.len(), 64 + MANIFEST_SUFFIX.len());
    }

    #[test]
    fn content_is_one_path_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![PathBuf::from("/cache/a.jar"), PathBuf::from("/cache/b.jar")];

        let file = store(dir.path(), &paths).unwrap();
        let content = fs::read_to_string(&file).unwrap();
        assert_eq!(content, "/cache/a.jar\n/cache/b.jar\n");
    }

    #[test]
    fn second_store_leaves_the_first_write_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![PathBuf::from("/cache/a.jar")];

        let file = store(dir.path(), &paths).unwrap();
        fs::write(&file, "sentinel").unwrap();

        let again = store(dir.path(), &paths).unwrap();
        assert_eq!(again, file);
        assert_eq!(fs::read_to_string(&file).unwrap(), "sentinel");
    }

    #[test]
    fn different_paths_produce_different_names() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), &[PathBuf::from("/cache/a.jar")]).unwrap();
        let b = store(dir.path(), &[PathBuf::from("/cache/b.jar")]).unwrap();
        assert_ne!(a, b);
    }
}
