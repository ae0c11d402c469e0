//! Image references in assistant text.
//!
//! Assistant messages often mention screenshots or rendered files by path.
//! The adapter scans outgoing text for path-looking tokens with an image
//! extension, resolves them (absolute, `~/`-prefixed, or relative to the
//! session cwd) and attaches the ones that exist as regular files.

use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp", "tiff"];

/// Find existing image files referenced in `text`. Each path appears once,
/// in order of first mention.
pub fn scan_image_paths(text: &str, cwd: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for raw in text.split_whitespace() {
        let token = raw
            .trim_matches(|c: char| matches!(c, '(' | ')' | '[' | ']' | '`' | '"' | '\''))
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        if !has_image_extension(token) {
            continue;
        }
        let Some(path) = resolve(token, cwd) else {
            continue;
        };
        if path.is_file() && !found.contains(&path) {
            found.push(path);
        }
    }
    found
}

fn has_image_extension(token: &str) -> bool {
    Path::new(token)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

fn resolve(token: &str, cwd: &Path) -> Option<PathBuf> {
    if let Some(rest) = token.strip_prefix("~/") {
        return dirs::home_dir().map(|home| home.join(rest));
    }
    let path = Path::new(token);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        Some(cwd.join(path))
    }
}
