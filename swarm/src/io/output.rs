//! Persisting task output under `.swarm/outputs/`.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow, bail};

use crate::io::atomic::write_atomic;

/// Validate a rendered output location and join it under `outputs_dir`.
///
/// The location must be relative and stay inside `outputs_dir`: absolute
/// paths, prefixes and any `..` component are rejected.
pub fn resolve_output_path(outputs_dir: &Path, location: &str) -> Result<PathBuf> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        bail!("output location is empty");
    }
    let relative = Path::new(trimmed);
    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!("output location '{trimmed}' escapes the outputs directory"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(anyhow!("output location '{trimmed}' must be relative"));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        bail!("output location '{trimmed}' names no file");
    }
    Ok(outputs_dir.join(clean))
}

/// Atomically write `contents` to the resolved location, returning the path
/// written. Parent directories are created.
pub fn write_output(outputs_dir: &Path, location: &str, contents: &str) -> Result<PathBuf> {
    let path = resolve_output_path(outputs_dir, location)?;
    write_atomic(&path, contents)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn nested_relative_paths_are_created() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_output(temp.path(), "docs/./intro.md", "hello").expect("write");
        assert_eq!(path, temp.path().join("docs").join("intro.md"));
        assert_eq!(fs::read_to_string(path).expect("read"), "hello");
    }

    #[test]
    fn rewriting_replaces_the_whole_file_and_leaves_no_temp() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_output(temp.path(), "notes.md", "a much longer first draft").expect("first");
        let path = write_output(temp.path(), "notes.md", "final").expect("second");

        assert_eq!(fs::read_to_string(&path).expect("read"), "final");
        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["notes.md".to_string()]);
    }

    #[test]
    fn escaping_locations_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        for bad in ["", "  ", "../x.md", "a/../../x.md", "/etc/passwd", "."] {
            assert!(
                resolve_output_path(temp.path(), bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }
}
