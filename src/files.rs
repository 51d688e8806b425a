//! Ambient-authority file helpers built on `cap-std`.
//!
//! Templates, parameter files and staged seed documents are all addressed by
//! plain paths supplied by the operator. These helpers open the parent
//! directory with ambient authority and then work relative to it, so the rest
//! of the crate never touches `std::fs` directly.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Expands a leading `~/` prefix to the user's home directory.
///
/// The input is returned unchanged when `HOME` is unset.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

fn split_path(path: &Utf8Path) -> Result<(Utf8PathBuf, Utf8PathBuf), String> {
    if path.is_absolute() {
        let parent = path
            .parent()
            .ok_or_else(|| format!("path has no parent directory: {path}"))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| format!("path has no file name: {path}"))?;
        return Ok((parent.to_path_buf(), Utf8PathBuf::from(file_name)));
    }
    Ok((Utf8PathBuf::from("."), path.to_path_buf()))
}

/// Reads a whole file as UTF-8, expanding a leading `~/`.
pub(crate) fn read_to_string(path: &Utf8Path) -> Result<String, String> {
    let expanded = Utf8PathBuf::from(expand_tilde(path.as_str()));
    let (dir_path, file_path) = split_path(&expanded)?;
    let dir =
        Dir::open_ambient_dir(&dir_path, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(&file_path).map_err(|err| err.to_string())
}

/// Returns `Ok(None)` when the file does not exist, otherwise its contents.
pub(crate) fn read_optional(path: &Utf8Path) -> Result<Option<String>, String> {
    if !path.exists() {
        return Ok(None);
    }
    read_to_string(path).map(Some)
}

/// Creates `dir` (and parents) and writes `contents` to `dir/name`.
pub(crate) fn write_file(dir: &Utf8Path, name: &str, contents: &str) -> Result<Utf8PathBuf, String> {
    let expanded = Utf8PathBuf::from(expand_tilde(dir.as_str()));
    Dir::create_ambient_dir_all(&expanded, ambient_authority()).map_err(|err| err.to_string())?;
    let handle =
        Dir::open_ambient_dir(&expanded, ambient_authority()).map_err(|err| err.to_string())?;
    handle.write(name, contents).map_err(|err| err.to_string())?;
    Ok(expanded.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8_dir(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 temp dir")
    }

    #[test]
    fn write_then_read_roundtrips_through_nested_dir() {
        let tmp = TempDir::new().expect("temp dir");
        let nested = utf8_dir(&tmp).join("a/b");
        let path = write_file(&nested, "doc.txt", "hello").expect("write");
        assert_eq!(read_to_string(&path).expect("read"), "hello");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde("/srv/templates"), "/srv/templates");
    }

    #[test]
    fn read_optional_returns_none_for_missing_file() {
        let tmp = TempDir::new().expect("temp dir");
        let missing = utf8_dir(&tmp).join("absent.tmpl");
        assert_eq!(read_optional(&missing).expect("lookup"), None);
    }
}
