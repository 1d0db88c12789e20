use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// join a client-supplied relative path onto `root`
///
/// the joined path must already be in canonical form: `..`, `.`, empty
/// components, trailing slashes and absolute paths are all rejected, which
/// keeps every result below `root`.
pub fn join_within(root: &Path, relative: &str) -> Result<PathBuf> {
    let root = root
        .to_str()
        .ok_or_else(|| Error::InvalidPath(format!("{} is not valid UTF-8", root.display())))?;
    let root = clean(root);
    let joined = format!("{}/{}", root.trim_end_matches('/'), relative);
    let cleaned = clean(&joined);

    if cleaned != joined || !cleaned.starts_with(&root) || cleaned.len() <= root.len() {
        return Err(Error::InvalidPath(format!(
            "path {:?} escapes or is not canonical within the build directory",
            relative
        )));
    }
    Ok(PathBuf::from(cleaned))
}

/// lexical path normalization: drops empty and `.` components, resolves `..`
fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            p => parts.push(p),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
