use crate::error::{KnowledgeError, KnowledgeResult};
use crate::knowledge::formats::UnitMark;
use crate::knowledge::source::SourceDocument;
use crate::knowledge::types::{KnowledgeChunk, Metadata};

/// Window size and overlap, in characters. `chunk_overlap < chunk_size` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl ChunkParams {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> KnowledgeResult<Self> {
        if chunk_size == 0 {
            return Err(KnowledgeError::configuration(
                "chunk_size must be a positive integer",
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(KnowledgeError::configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.chunk_overlap
    }
}

/// One window of the input text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow<'a> {
    pub index: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: &'a str,
}

/// Fixed-size overlapping character windows.
///
/// Windows start every `chunk_size - chunk_overlap` characters; the last one
/// may be shorter. Boundaries depend only on the text and the parameters.
#[derive(Debug, Clone)]
pub struct TextChunker {
    params: ChunkParams,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> KnowledgeResult<Self> {
        Ok(Self {
            params: ChunkParams::new(chunk_size, chunk_overlap)?,
        })
    }

    pub fn from_params(params: ChunkParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> ChunkParams {
        self.params
    }

    /// Lazily iterate windows over `text`. Call again to restart from the beginning.
    pub fn windows<'a>(&self, text: &'a str) -> ChunkWindows<'a> {
        // Byte offset of every char start, plus the end of the text
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        ChunkWindows {
            text,
            offsets,
            params: self.params,
            next_start: Some(0),
            index: 0,
        }
    }

    /// Cut a loaded document into chunks that inherit its metadata, plus the
    /// pages or rows each chunk covers
    pub fn chunk_document(
        &self,
        document: &SourceDocument,
        collection: &str,
    ) -> Vec<KnowledgeChunk> {
        let content_hash = crate::storage::content_hash(&document.text);

        self.windows(&document.text)
            .map(|window| {
                let mut metadata = document.metadata.clone();
                metadata.extend(unit_metadata(
                    &document.units,
                    window.char_start,
                    window.char_end,
                ));
                KnowledgeChunk {
                    id: chunk_id(&document.id, window.index, &content_hash),
                    source_id: document.id.clone(),
                    collection: collection.to_string(),
                    chunk_index: window.index,
                    content: window.text.to_string(),
                    char_start: window.char_start,
                    char_end: window.char_end,
                    content_hash: content_hash.clone(),
                    metadata,
                }
            })
            .collect()
    }
}

/// Units touching `[char_start, char_end)`, one entry per unit key: `page = "3"`,
/// `row = "12-18"`. A unit runs until the next unit of the same key starts.
pub fn unit_metadata(units: &[UnitMark], char_start: usize, char_end: usize) -> Metadata {
    let mut metadata = Metadata::new();
    let mut keys: Vec<&'static str> = units.iter().map(|u| u.key).collect();
    keys.sort_unstable();
    keys.dedup();

    for key in keys {
        let marks: Vec<&UnitMark> = units.iter().filter(|u| u.key == key).collect();
        let touched = marks.iter().enumerate().filter(|(i, mark)| {
            let unit_end = marks.get(i + 1).map_or(usize::MAX, |next| next.char_start);
            mark.char_start < char_end && unit_end > char_start
        });

        let (mut low, mut high) = (usize::MAX, 0);
        for (_, mark) in touched {
            low = low.min(mark.number);
            high = high.max(mark.number);
        }
        match (low, high) {
            (usize::MAX, _) => {}
            (low, high) if low == high => {
                metadata.insert(key.to_string(), low.to_string());
            }
            (low, high) => {
                metadata.insert(key.to_string(), format!("{}-{}", low, high));
            }
        }
    }
    metadata
}

/// Deterministic so re-ingesting identical content yields identical ids
fn chunk_id(source_id: &str, index: usize, content_hash: &str) -> String {
    crate::storage::short_hash(&format!("{}\u{0}{}\u{0}{}", source_id, index, content_hash))
}

#[derive(Debug, Clone)]
pub struct ChunkWindows<'a> {
    text: &'a str,
    offsets: Vec<usize>,
    params: ChunkParams,
    next_start: Option<usize>,
    index: usize,
}

impl<'a> ChunkWindows<'a> {
    fn char_count(&self) -> usize {
        self.offsets.len() - 1
    }
}

impl<'a> Iterator for ChunkWindows<'a> {
    type Item = TextWindow<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start?;
        let total = self.char_count();
        if start >= total {
            self.next_start = None;
            return None;
        }

        let end = (start + self.params.chunk_size).min(total);
        self.next_start = if end >= total {
            None
        } else {
            Some(start + self.params.stride())
        };

        let window = TextWindow {
            index: self.index,
            char_start: start,
            char_end: end,
            text: &self.text[self.offsets[start]..self.offsets[end]],
        };
        self.index += 1;
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the text by appending each window minus the part shared with its predecessor
    fn reconstruct(windows: &[TextWindow<'_>]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for window in windows {
            let skip = covered - window.char_start;
            out.extend(window.text.chars().skip(skip));
            covered = window.char_end;
        }
        out
    }

    #[test]
    fn test_overlap_not_smaller_than_size_rejected() {
        assert!(TextChunker::new(100, 100).unwrap_err().is_configuration());
        assert!(TextChunker::new(100, 150).unwrap_err().is_configuration());
        assert!(TextChunker::new(0, 0).unwrap_err().is_configuration());
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let chunker = TextChunker::new(10, 2).unwrap();
        assert_eq!(chunker.windows("").count(), 0);
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = TextChunker::new(4000, 200).unwrap();
        let text = "Users name is John. He is 30 years old and lives in San Francisco.";
        let windows: Vec<_> = chunker.windows(text).collect();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].text, text);
        assert_eq!(windows[0].char_start, 0);
        assert_eq!(windows[0].char_end, text.chars().count());
    }

    #[test]
    fn test_chunk_overlap() {
        let chunker = TextChunker::new(100, 20).unwrap();
        let text: String = (0..250).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let windows: Vec<_> = chunker.windows(&text).collect();

        // starts at 0, 80, 160; the last window reaches the end
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].char_start, 80);
        assert_eq!(windows[2].char_end, 250);
        let tail_of_first: String = windows[0].text.chars().skip(80).collect();
        assert!(windows[1].text.starts_with(&tail_of_first));
    }

    #[test]
    fn test_final_chunk_may_be_shorter() {
        let chunker = TextChunker::new(10, 3).unwrap();
        let windows: Vec<_> = chunker.windows("abcdefghijklmnop").collect();
        let last = windows.last().unwrap();
        assert!(last.text.chars().count() < 10);
        assert_eq!(last.char_end, 16);
    }

    #[test]
    fn test_reconstructs_input_exactly() {
        let texts = [
            "a".to_string(),
            "exactly ten".to_string(),
            "The quick brown fox jumps over the lazy dog. ".repeat(20),
            "Größe, café, naïve, 日本語のテキスト, emoji 🚀🚀 mixed in.".repeat(7),
        ];
        let params = [(1, 0), (3, 1), (10, 9), (16, 4), (64, 0), (100, 50)];

        for text in texts.iter() {
            for (size, overlap) in params {
                let chunker = TextChunker::new(size, overlap).unwrap();
                let windows: Vec<_> = chunker.windows(text).collect();
                assert_eq!(
                    &reconstruct(&windows),
                    text,
                    "size={} overlap={}",
                    size,
                    overlap
                );
                assert!(windows.iter().all(|w| w.text.chars().count() <= size));
            }
        }
    }

    #[test]
    fn test_restartable_and_deterministic() {
        let chunker = TextChunker::new(7, 2).unwrap();
        let text = "deterministic chunk boundaries are required";
        let first: Vec<_> = chunker.windows(text).collect();
        let second: Vec<_> = chunker.windows(text).collect();
        assert_eq!(first, second);

        let mut iter = chunker.windows(text);
        iter.next();
        let resumed = iter.clone();
        assert_eq!(iter.collect::<Vec<_>>(), resumed.collect::<Vec<_>>());
    }

    #[test]
    fn test_chunk_document_inherits_metadata() {
        let chunker = TextChunker::new(10, 2).unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("file_name".to_string(), "notes.txt".to_string());
        let document = SourceDocument {
            id: "notes.txt".to_string(),
            text: "0123456789abcdefghij".to_string(),
            metadata,
            units: Vec::new(),
        };

        let chunks = chunker.chunk_document(&document, "knowledge");
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(chunk.collection, "knowledge");
            assert_eq!(chunk.source_id, "notes.txt");
            assert_eq!(chunk.metadata.get("file_name").unwrap(), "notes.txt");
        }

        // same input, same ids
        let again = chunker.chunk_document(&document, "knowledge");
        assert_eq!(chunks, again);
        assert_ne!(chunks[0].id, chunks[1].id);
    }

    fn mark(key: &'static str, number: usize, char_start: usize) -> UnitMark {
        UnitMark {
            key,
            number,
            char_start,
        }
    }

    #[test]
    fn test_unit_metadata_ranges() {
        let pages = [mark("page", 1, 0), mark("page", 2, 10), mark("page", 3, 20)];
        assert_eq!(unit_metadata(&pages, 0, 10).get("page").unwrap(), "1");
        assert_eq!(unit_metadata(&pages, 5, 15).get("page").unwrap(), "1-2");
        assert_eq!(unit_metadata(&pages, 12, 40).get("page").unwrap(), "2-3");
        assert!(unit_metadata(&[], 0, 10).is_empty());
    }

    #[test]
    fn test_chunks_carry_page_numbers() {
        let chunker = TextChunker::new(8, 0).unwrap();
        let document = SourceDocument {
            id: "report.pdf".to_string(),
            text: "intro\n\nfindings\n\nclosing".to_string(),
            metadata: Metadata::new(),
            units: vec![mark("page", 1, 0), mark("page", 2, 7), mark("page", 3, 17)],
        };

        let pages: Vec<String> = chunker
            .chunk_document(&document, "knowledge")
            .iter()
            .map(|c| c.metadata.get("page").cloned().unwrap_or_default())
            .collect();
        // windows [0,8) [8,16) [16,24); page 2 spans [7,17)
        assert_eq!(pages, vec!["1-2", "2", "2-3"]);
    }
}
