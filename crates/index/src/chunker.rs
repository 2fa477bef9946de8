//! Fixed-window overlapping text chunker.
//!
//! Splits a document's extracted text into windows of `window_chars`
//! characters, each starting `window_chars - overlap_chars` characters after
//! the previous one. Windows are counted in characters but offsets are byte
//! offsets, so a chunk never splits a UTF-8 code point.
//!
//! Chunking is a pure function of (text, window, overlap): re-indexing the
//! same text yields byte-identical chunks with the same ordinals.

use quill_config::IndexConfig;
use quill_core::document::DocumentId;
use quill_core::error::IndexError;
use quill_core::index::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    window_chars: usize,
    overlap_chars: usize,
}

impl Chunker {
    pub fn new(window_chars: usize, overlap_chars: usize) -> Result<Self, IndexError> {
        if window_chars == 0 {
            return Err(IndexError::InvalidParameters(
                "window must be at least one character".into(),
            ));
        }
        if overlap_chars >= window_chars {
            return Err(IndexError::InvalidParameters(format!(
                "overlap ({overlap_chars}) must be smaller than window ({window_chars})"
            )));
        }
        Ok(Self {
            window_chars,
            overlap_chars,
        })
    }

    pub fn from_config(config: &IndexConfig) -> Result<Self, IndexError> {
        Self::new(config.window_chars, config.overlap_chars)
    }

    pub fn window_chars(&self) -> usize {
        self.window_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Split `text` into chunks. Empty text yields no chunks.
    pub fn chunk(&self, doc_id: &DocumentId, text: &str) -> Vec<Chunk> {
        if text.is_empty() {
            return Vec::new();
        }

        // Byte offset of every char boundary, including the end of text.
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = boundaries.len() - 1;
        let step = self.window_chars - self.overlap_chars;

        let mut chunks = Vec::with_capacity(char_count / step + 1);
        let mut start = 0;
        loop {
            let end = (start + self.window_chars).min(char_count);
            let (start_offset, end_offset) = (boundaries[start], boundaries[end]);
            chunks.push(Chunk {
                doc_id: doc_id.clone(),
                ordinal: chunks.len(),
                text: text[start_offset..end_offset].to_string(),
                start_offset,
                end_offset,
            });
            if end == char_count {
                break;
            }
            start += step;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentId {
        DocumentId::from("doc-1")
    }

    #[test]
    fn rejects_overlap_not_smaller_than_window() {
        assert!(Chunker::new(10, 10).is_err());
        assert!(Chunker::new(0, 0).is_err());
        assert!(Chunker::new(10, 9).is_ok());
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let chunker = Chunker::new(10, 2).unwrap();
        assert!(chunker.chunk(&doc(), "").is_empty());
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunker = Chunker::new(100, 20).unwrap();
        let chunks = chunker.chunk(&doc(), "Hello, world!");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 13);
    }

    #[test]
    fn windows_overlap_by_configured_amount() {
        let chunker = Chunker::new(4, 1).unwrap();
        let chunks = chunker.chunk(&doc(), "abcdefghij");
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
        }
    }

    #[test]
    fn final_window_may_be_short() {
        let chunker = Chunker::new(4, 2).unwrap();
        let chunks = chunker.chunk(&doc(), "abcdefg");
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "cdef", "efg"]);
    }

    #[test]
    fn offsets_slice_back_to_text() {
        let text = "Ünïcödé text — with multibyte chars ✓ across windows";
        let chunker = Chunker::new(7, 3).unwrap();
        for chunk in chunker.chunk(&doc(), text) {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.text);
            assert!(chunk.text.chars().count() <= 7);
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let chunker = Chunker::new(120, 30).unwrap();
        let first = chunker.chunk(&doc(), &text);
        let second = chunker.chunk(&doc(), &text);
        assert_eq!(first, second);
        assert!(first.len() > 1);
    }
}
