//! Filesystem-safe group identifiers.

use crate::contract::operation::DEFAULT_GROUP;

/// Normalises a group name into a token usable as a directory name.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `_`. Input without a
/// single allowed character (empty, blank, `"!!!"`, `".."`) yields
/// [`DEFAULT_GROUP`].
#[must_use]
pub fn sanitize_group(raw: &str) -> String {
    if !raw.chars().any(is_allowed) {
        return DEFAULT_GROUP.to_string();
    }

    raw.chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .collect()
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
