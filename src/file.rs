use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Upper bound on the number of bytes inspected for NUL bytes.
const BINARY_SCAN_LIMIT: usize = 8000;

static BINARY_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "so", "dylib", "a", "o", "obj", "png", "jpg", "jpeg", "gif", "bmp", "ico",
        "webp", "mp3", "mp4", "avi", "mkv", "mov", "wav", "flac", "pdf", "doc", "docx", "xls",
        "xlsx", "ppt", "pptx", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "wasm", "pyc",
        "class", "jar", "woff", "woff2", "ttf", "otf", "eot",
    ]
    .into_iter()
    .collect()
});

/// A text file read from the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path to the file
    pub absolute_path: PathBuf,

    /// Path relative to the repository root, `/`-separated
    pub relative_path: String,

    /// Decoded UTF-8 content
    pub content: String,
}

impl SourceFile {
    /// Size of the content in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }

    /// Number of lines in the content.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.content.lines().count()
    }
}

/// Outcome of reading a candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Decoded text
    Text(String),
    /// Binary by extension or content; skipped
    Binary,
}

/// Returns true if the bytes look binary.
///
/// Only the first half of the content, capped at 8000 bytes, is searched
/// for a NUL byte.
#[must_use]
pub fn is_binary_content(bytes: &[u8]) -> bool {
    let scanned = (bytes.len() / 2).min(BINARY_SCAN_LIMIT);
    memchr::memchr(0, &bytes[..scanned]).is_some()
}

/// Checks if a file extension suggests a binary file.
#[must_use]
pub(crate) fn has_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(ext.to_ascii_lowercase().as_str()))
}

/// Reads a file, classifying it as text or binary.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid UTF-8.
pub(crate) fn read_source(path: &Path) -> Result<ReadOutcome> {
    if has_binary_extension(path) {
        return Ok(ReadOutcome::Binary);
    }

    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    if is_binary_content(&bytes) {
        return Ok(ReadOutcome::Binary);
    }

    String::from_utf8(bytes)
        .map(ReadOutcome::Text)
        .map_err(|_| Error::invalid_utf8(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_nul_in_first_half_is_binary() {
        let mut bytes = vec![b'a'; 100];
        bytes[10] = 0;
        assert!(is_binary_content(&bytes));
    }

    #[test]
    fn test_nul_in_second_half_is_text() {
        let mut bytes = vec![b'a'; 100];
        bytes[80] = 0;
        assert!(!is_binary_content(&bytes));
    }

    #[test]
    fn test_nul_scan_is_capped() {
        let mut bytes = vec![b'a'; 40_000];
        bytes[9_000] = 0;
        assert!(!is_binary_content(&bytes));
        assert!(!is_binary_content(&[]));
    }

    #[test]
    fn test_has_binary_extension() {
        assert!(has_binary_extension(Path::new("app.exe")));
        assert!(has_binary_extension(Path::new("image.PNG")));
        assert!(has_binary_extension(Path::new("archive.zip")));
        assert!(!has_binary_extension(Path::new("code.rs")));
        assert!(!has_binary_extension(Path::new("Makefile")));
    }

    #[test]
    fn test_read_source_classifies() {
        let temp = assert_fs::TempDir::new().unwrap();
        let text = temp.child("main.rs");
        text.write_str("fn main() {}").unwrap();
        let blob = temp.child("data.bin");
        blob.write_binary(&[0u8; 64]).unwrap();
        let image = temp.child("logo.png");
        image.write_str("not really a png").unwrap();

        assert_eq!(
            read_source(text.path()).unwrap(),
            ReadOutcome::Text("fn main() {}".to_string())
        );
        assert_eq!(read_source(blob.path()).unwrap(), ReadOutcome::Binary);
        assert_eq!(read_source(image.path()).unwrap(), ReadOutcome::Binary);
    }

    #[test]
    fn test_read_source_rejects_invalid_utf8() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("latin1.txt");
        file.write_binary(&[b'c', b'a', b'f', 0xE9, b'!', b'!']).unwrap();

        let err = read_source(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_source_file_helpers() {
        let file = SourceFile {
            absolute_path: PathBuf::from("/repo/a.txt"),
            relative_path: "a.txt".to_string(),
            content: "one\ntwo\nthree".to_string(),
        };
        assert_eq!(file.line_count(), 3);
        assert_eq!(file.size_bytes(), 13);
    }
}
