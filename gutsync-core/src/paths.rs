//! Path helpers for change events and staging scope.

use crate::backend::{IGNORE_FILE, METADATA_DIR};

/// Staging scope meaning "the whole tree".
pub const ROOT_PREFIX: &str = ".";

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty())
}

/// Whether `path` lies inside the backend's metadata directory.
pub fn is_metadata_path(path: &str) -> bool {
    components(path).any(|c| c == METADATA_DIR)
}

/// Whether the last component of `path` is the ignore file.
pub fn is_ignore_file(path: &str) -> bool {
    components(path).last() == Some(IGNORE_FILE)
}

/// Narrowest directory that covers every changed path.
///
/// Takes the longest common string prefix and cuts it back to the last
/// separator, so `test/sarah` and `test/sally` give `test` rather than
/// `test/sa`. No paths, or nothing left after the cut, gives the root.
pub fn common_prefix_trim<S: AsRef<str>>(paths: &[S], separator: char) -> String {
    let Some((first, rest)) = paths.split_first() else {
        return ROOT_PREFIX.to_string();
    };
    let first = first.as_ref();
    let mut len = first.len();
    for path in rest {
        let common = first
            .char_indices()
            .zip(path.as_ref().chars())
            .find(|((_, a), b)| a != b)
            .map(|((i, _), _)| i)
            .unwrap_or_else(|| first.len().min(path.as_ref().len()));
        len = len.min(common);
    }
    let common = &first[..len];
    match common.rfind(separator) {
        Some(0) | None => ROOT_PREFIX.to_string(),
        Some(idx) => common[..idx].to_string(),
    }
}
