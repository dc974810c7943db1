//! Flattens a repository dump into overlapping text chunks for retrieval.

use crate::{
    dump::{FileInfo, RepositoryDump},
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Default chunk length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

const SEPARATOR: &str = "\n\n";

/// Provenance of a [`DocumentChunk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Repository-relative path of the source file
    pub path: String,
    /// Whole content of the source file, when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
}

/// A retrieval unit: a character slice of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    /// Text of the chunk
    pub page_content: String,
    /// Where the chunk came from
    pub metadata: ChunkMetadata,
}

/// Splits file contents into overlapping character chunks.
///
/// Text is cut on blank lines and the pieces are merged back up to
/// `chunk_size` characters, carrying up to `chunk_overlap` characters of
/// trailing pieces into the next chunk. A piece longer than `chunk_size` is
/// cut into fixed windows first.
#[derive(Debug, Clone)]
pub struct DocumentExtractor {
    chunk_size: usize,
    chunk_overlap: usize,
    include_full_content: bool,
}

impl Default for DocumentExtractor {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            include_full_content: true,
        }
    }
}

impl DocumentExtractor {
    /// Creates an extractor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `chunk_size` is zero or the overlap is
    /// not smaller than the chunk size.
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        include_full_content: bool,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than 0"));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::config(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_overlap,
            include_full_content,
        })
    }

    /// Chunk length in characters.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Overlap between chunks in characters.
    #[must_use]
    pub const fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Extracts chunks from every file of the dump.
    #[must_use]
    pub fn extract(&self, dump: &RepositoryDump) -> Vec<DocumentChunk> {
        let chunks: Vec<DocumentChunk> = dump
            .files()
            .into_iter()
            .flat_map(|file| self.extract_file(file))
            .collect();

        debug!(
            "Extracted {} chunks from {} files",
            chunks.len(),
            dump.count_files()
        );
        chunks
    }

    fn extract_file(&self, file: &FileInfo) -> Vec<DocumentChunk> {
        let text = format!("<file path=\"{}\">\n{}", file.path, file.content);
        let full_content = self.include_full_content.then(|| file.content.clone());

        let chunks: Vec<DocumentChunk> = self
            .split_text(&text)
            .into_iter()
            .map(|page_content| DocumentChunk {
                page_content,
                metadata: ChunkMetadata {
                    path: file.path.clone(),
                    full_content: full_content.clone(),
                },
            })
            .collect();

        trace!("'{}' -> {} chunks", file.path, chunks.len());
        chunks
    }

    /// Chunks arbitrary text attributed to `path`, without full content.
    #[must_use]
    pub fn extract_text(&self, path: &str, text: &str) -> Vec<DocumentChunk> {
        self.split_text(text)
            .into_iter()
            .map(|page_content| DocumentChunk {
                page_content,
                metadata: ChunkMetadata {
                    path: path.to_string(),
                    full_content: None,
                },
            })
            .collect()
    }

    /// Splits text into chunks of at most `chunk_size` characters.
    #[must_use]
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let pieces: Vec<String> = text
            .split(SEPARATOR)
            .filter(|piece| !piece.is_empty())
            .flat_map(|piece| self.window(piece))
            .collect();

        self.merge_pieces(pieces)
    }

    /// Cuts an oversized piece into overlapping windows.
    fn window(&self, piece: &str) -> Vec<String> {
        let chars: Vec<char> = piece.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![piece.to_string()];
        }

        let step = self.chunk_size - self.chunk_overlap;
        let mut windows = Vec::with_capacity(chars.len() / step + 1);
        let mut start = 0;

        loop {
            let end = (start + self.chunk_size).min(chars.len());
            windows.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }

        windows
    }

    fn merge_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let separator_len = SEPARATOR.chars().count();
        let mut chunks = Vec::new();
        let mut current: VecDeque<(String, usize)> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = piece.chars().count();
            let joiner = |current: &VecDeque<(String, usize)>| {
                if current.is_empty() { 0 } else { separator_len }
            };

            if total + len + joiner(&current) > self.chunk_size && !current.is_empty() {
                chunks.push(join(&current));

                // Keep only as much tail as the overlap allows, and only if
                // the next piece still fits after it.
                while total > self.chunk_overlap
                    || (total > 0 && total + len + joiner(&current) > self.chunk_size)
                {
                    let Some((_, front_len)) = current.pop_front() else {
                        break;
                    };
                    total -= front_len + if current.is_empty() { 0 } else { separator_len };
                }
            }

            total += len + joiner(&current);
            current.push_back((piece, len));
        }

        if !current.is_empty() {
            chunks.push(join(&current));
        }

        chunks
    }
}

fn join(pieces: &VecDeque<(String, usize)>) -> String {
    pieces
        .iter()
        .map(|(piece, _)| piece.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(size: usize, overlap: usize) -> DocumentExtractor {
        DocumentExtractor::new(size, overlap, true).unwrap()
    }

    #[test]
    fn test_rejects_invalid_sizes() {
        assert!(DocumentExtractor::new(0, 0, true).unwrap_err().is_config());
        assert!(DocumentExtractor::new(100, 100, true).unwrap_err().is_config());
        assert!(DocumentExtractor::new(100, 99, true).is_ok());
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = extractor(1000, 200).split_text("alpha\n\nbeta");
        assert_eq!(chunks, vec!["alpha\n\nbeta".to_string()]);
    }

    #[test]
    fn test_merges_paragraphs_up_to_size() {
        let text = ["aaaa", "bbbb", "cccc", "dddd"].join("\n\n");
        let chunks = extractor(10, 0).split_text(&text);

        assert_eq!(chunks, vec!["aaaa\n\nbbbb", "cccc\n\ndddd"]);
    }

    #[test]
    fn test_overlap_carries_trailing_pieces() {
        let text = ["aaaa", "bbbb", "cccc"].join("\n\n");
        let chunks = extractor(10, 4).split_text(&text);

        assert_eq!(chunks, vec!["aaaa\n\nbbbb", "bbbb\n\ncccc"]);
    }

    #[test]
    fn test_oversized_piece_is_windowed() {
        let text = "x".repeat(25);
        let chunks = extractor(10, 2).split_text(&text);

        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        let covered: usize = chunks.iter().map(|c| c.len()).sum();
        assert!(covered >= 25);
        assert_eq!(chunks.first().map(String::len), Some(10));
    }

    #[test]
    fn test_chunks_never_exceed_size() {
        let text = (0..50)
            .map(|i| format!("paragraph {i} {}", "w".repeat(i % 17)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let extractor = extractor(64, 16);

        for chunk in extractor.split_text(&text) {
            assert!(chunk.chars().count() <= 64, "chunk too long: {chunk:?}");
        }
    }

    #[test]
    fn test_extract_attaches_metadata() {
        let dump = RepositoryDump::from_file_contents([
            ("src/lib.rs", "pub fn lib() {}"),
            ("README.md", "# Title\n\nBody"),
        ])
        .unwrap();

        let chunks = extractor(1000, 200).extract(&dump);

        assert_eq!(chunks.len(), 2);
        let readme = chunks.iter().find(|c| c.metadata.path == "README.md").unwrap();
        assert!(readme.page_content.starts_with("<file path=\"README.md\">\n"));
        assert_eq!(readme.metadata.full_content.as_deref(), Some("# Title\n\nBody"));
    }

    #[test]
    fn test_extract_without_full_content() {
        let dump = RepositoryDump::from_file_contents([("a.txt", "text")]).unwrap();
        let chunks = DocumentExtractor::new(100, 10, false).unwrap().extract(&dump);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].metadata.full_content.is_none());
    }

    #[test]
    fn test_large_file_spans_chunks_with_same_path() {
        let body = (0..40).map(|i| format!("block {i}")).collect::<Vec<_>>().join("\n\n");
        let dump = RepositoryDump::from_file_contents([("docs/guide.md", body)]).unwrap();

        let chunks = extractor(50, 10).extract(&dump);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.metadata.path == "docs/guide.md"));
    }

    #[test]
    fn test_extract_text_uses_given_path() {
        let chunks = extractor(1000, 200).extract_text("digest", "<summary>..</summary>");
        assert_eq!(chunks[0].metadata.path, "digest");
        assert!(chunks[0].metadata.full_content.is_none());
    }

    #[test]
    fn test_serializes_camel_case() {
        let chunk = DocumentChunk {
            page_content: "x".into(),
            metadata: ChunkMetadata {
                path: "a".into(),
                full_content: Some("x".into()),
            },
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert!(json.get("pageContent").is_some());
        assert!(json["metadata"].get("fullContent").is_some());
    }
}
