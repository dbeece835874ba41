//! Filename safety checks for paths that are joined onto the data directory.

/// Longest filename accepted for model weights or configs.
pub const MAX_FILENAME_LEN: usize = 255;

/// Whether `name` can be joined onto a directory without escaping it.
///
/// Accepts 1..=255 characters of `[A-Za-z0-9._-]` that do not start with a
/// dot, which rules out `..`, hidden files, separators, and drive prefixes.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
