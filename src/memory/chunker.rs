//! Splits documents into overlapping pieces for independent embedding.
//!
//! Sizes and offsets are in bytes, always snapped to `char` boundaries. Chunks are
//! contiguous slices of the input: consecutive chunks overlap by `overlap` bytes and
//! together cover every byte, so the original text can be rebuilt by dropping each
//! chunk's overlap with its predecessor.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    /// Leading import/use/include lines of a source file.
    Imports,
    /// A top-level definition (or part of one) from a source file.
    Code,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Imports => "imports",
            Self::Code => "code",
        }
    }
}

/// One chunk with its byte range in the source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    pub content: String,
    pub start: usize,
    pub end: usize,
    pub kind: ChunkKind,
}

/// Split `text` into chunks of at most `max_size` bytes sharing `overlap` bytes.
pub fn chunk(text: &str, max_size: usize, overlap: usize) -> Vec<String> {
    chunk_spans(text, max_size, overlap)
        .into_iter()
        .map(|c| c.content)
        .collect()
}

/// Like [`chunk`], keeping byte offsets.
///
/// Each cut prefers, in order: the last paragraph break (`\n\n`), the last line break,
/// the last whitespace, all within the window and past its midpoint. Failing those the
/// window is hard-split.
pub fn chunk_spans(text: &str, max_size: usize, overlap: usize) -> Vec<TextChunk> {
    spans(text, 0, text.len(), max_size, overlap)
        .into_iter()
        .map(|(start, end)| TextChunk {
            content: text[start..end].to_string(),
            start,
            end,
            kind: ChunkKind::Text,
        })
        .collect()
}

/// Byte ranges covering `text[from..to]`.
fn spans(text: &str, from: usize, to: usize, max_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    if from >= to {
        return Vec::new();
    }
    let max_size = max_size.max(1);
    let overlap = overlap.min(max_size - 1);

    let mut out = Vec::new();
    let mut start = from;
    loop {
        if to - start <= max_size {
            out.push((start, to));
            return out;
        }

        let mut limit = floor_boundary(text, start + max_size);
        if limit <= start {
            // a single char wider than max_size
            limit = ceil_boundary(text, start + 1);
        }
        let min_end = start + (overlap + 1).max(max_size / 2);
        let end = preferred_break(&text[start..limit], start, min_end).unwrap_or(limit);
        out.push((start, end));

        let mut next = floor_boundary(text, end - overlap.min(end - start));
        if next <= start {
            next = end;
        }
        start = next;
    }
}

/// Absolute end offset of the best break inside `window`, if one lies at or past `min_end`.
fn preferred_break(window: &str, offset: usize, min_end: usize) -> Option<usize> {
    let candidates = [
        window.rfind("\n\n").map(|i| i + 2),
        window.rfind('\n').map(|i| i + 1),
        window
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8()),
    ];
    candidates
        .into_iter()
        .flatten()
        .map(|i| offset + i)
        .find(|&end| end >= min_end)
}

fn floor_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(text: &str, mut i: usize) -> usize {
    if i >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(i) {
        i += 1;
    }
    i
}

const IMPORT_PREFIXES: &[&str] = &[
    "use ", "pub use ", "import ", "from ", "using ", "#include", "#import", "require ",
    "extern crate ", "package ",
];

const DEFINITION_KEYWORDS: &[&str] = &[
    "fn ", "struct ", "enum ", "trait ", "impl ", "impl<", "mod ", "macro_rules!", "class ",
    "def ", "function ", "func ", "interface ", "type ", "const ", "static ",
];

const DEFINITION_MODIFIERS: &[&str] = &[
    "pub(crate) ", "pub(super) ", "pub ", "export default ", "export ", "async ", "unsafe ",
    "abstract ", "public ", "private ", "protected ", "static ", "final ",
];

fn is_import_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    IMPORT_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["//", "/*", "*", "--", "#!"]
        .iter()
        .any(|p| trimmed.starts_with(p))
}

/// Top-level definition: unindented, optional modifiers, then a definition keyword.
fn is_definition_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let mut rest = line;
    while let Some(stripped) = DEFINITION_MODIFIERS.iter().find_map(|m| rest.strip_prefix(m)) {
        rest = stripped;
    }
    DEFINITION_KEYWORDS.iter().any(|k| rest.starts_with(k))
}

/// Lines that belong to the definition that follows them.
fn is_attached_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    !trimmed.is_empty()
        && (trimmed.starts_with("#[") || trimmed.starts_with('@') || is_comment_line(line))
}

/// Code-aware chunking for source files.
///
/// Leading import lines (with any comments between them) become [`ChunkKind::Imports`]
/// chunks. The rest is split before each top-level definition, with attributes, doc
/// comments, and decorators kept with the definition they precede. Blocks larger than
/// `max_size` fall back to [`chunk_spans`]. Whitespace-only blocks are dropped.
pub fn chunk_code(source: &str, max_size: usize, overlap: usize) -> Vec<TextChunk> {
    if source.is_empty() {
        return Vec::new();
    }

    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in source.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    // Leading import section: imports, blanks, and comments, ending at the last import.
    let mut imports_end = 0;
    let mut body_line = 0;
    for (i, (start, line)) in lines.iter().enumerate() {
        if is_import_line(line) {
            imports_end = start + line.len();
            body_line = i + 1;
        } else if !(line.trim().is_empty() || is_comment_line(line)) {
            break;
        }
    }

    let mut boundaries: Vec<usize> = vec![imports_end];
    for i in body_line..lines.len() {
        if !is_definition_line(lines[i].1) {
            continue;
        }
        let mut first = i;
        while first > body_line && is_attached_line(lines[first - 1].1) {
            first -= 1;
        }
        let at = lines[first].0;
        if boundaries.last().is_some_and(|&b| at > b) {
            boundaries.push(at);
        }
    }
    boundaries.push(source.len());

    let mut chunks = Vec::new();
    chunks.extend(
        spans(source, 0, imports_end, max_size, overlap)
            .into_iter()
            .map(|(s, e)| code_chunk(source, s, e, ChunkKind::Imports)),
    );
    for block in boundaries.windows(2) {
        let (from, to) = (block[0], block[1]);
        if source[from..to].trim().is_empty() {
            continue;
        }
        chunks.extend(
            spans(source, from, to, max_size, overlap)
                .into_iter()
                .map(|(s, e)| code_chunk(source, s, e, ChunkKind::Code)),
        );
    }
    chunks
}

fn code_chunk(source: &str, start: usize, end: usize, kind: ChunkKind) -> TextChunk {
    TextChunk {
        content: source[start..end].to_string(),
        start,
        end,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the input by dropping each chunk's overlap with its predecessor.
    fn reassemble(chunks: &[TextChunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for c in chunks {
            assert!(c.start <= covered, "gap before byte {}", c.start);
            if c.end > covered {
                out.push_str(&c.content[covered - c.start..]);
                covered = c.end;
            }
        }
        out
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk("", 100, 10).is_empty());
        assert!(chunk_code("", 100, 10).is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let text = "A short note.\n\nWith two paragraphs.";
        assert_eq!(chunk(text, 1000, 200), vec![text.to_string()]);
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let first = "First paragraph sentence. ".repeat(3);
        let second = "Second paragraph goes here. ".repeat(3);
        let text = format!("{first}\n\n{second}");
        let chunks = chunk_spans(&text, 100, 10);

        assert_eq!(chunks[0].end, first.len() + 2);
        assert!(chunks[0].content.ends_with("\n\n"));
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn hard_splits_text_without_breaks() {
        let text = "x".repeat(250);
        let chunks = chunk_spans(&text, 100, 20);
        let ranges: Vec<(usize, usize)> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(ranges, vec![(0, 100), (80, 180), (160, 250)]);
    }

    #[test]
    fn multibyte_text_is_split_on_char_boundaries() {
        let text = "é".repeat(300);
        let chunks = chunk_spans(&text, 101, 11);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.len() <= 101);
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn chunks_always_cover_the_input() {
        let text = "Lorem ipsum dolor sit amet,\nconsectetur adipiscing elit.\n\n".repeat(40);
        for (size, overlap) in [(50, 0), (120, 30), (333, 100), (1000, 999)] {
            let chunks = chunk_spans(&text, size, overlap);
            assert_eq!(chunks.first().unwrap().start, 0);
            assert_eq!(chunks.last().unwrap().end, text.len());
            assert_eq!(reassemble(&chunks), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn code_chunks_split_at_definitions() {
        let source = "\
use std::fmt;
use std::io;

/// Adds.
pub fn add(a: i32, b: i32) -> i32 {
    a + b
}

#[derive(Debug)]
struct Point {
    x: i32,
}

impl Point {
    fn new() -> Self {
        Self { x: 0 }
    }
}
";
        let chunks = chunk_code(source, 1000, 0);
        let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::Imports, ChunkKind::Code, ChunkKind::Code, ChunkKind::Code]
        );
        assert_eq!(chunks[0].content, "use std::fmt;\nuse std::io;\n");
        assert!(chunks[1].content.trim_start().starts_with("/// Adds."));
        assert!(chunks[2].content.trim_start().starts_with("#[derive(Debug)]"));
        assert!(chunks[3].content.starts_with("impl Point"));
    }

    #[test]
    fn oversized_definition_falls_back_to_text_chunking() {
        let body = "    let x = 1;\n".repeat(20);
        let source = format!("def big():\n{body}");
        let chunks = chunk_code(&source, 80, 10);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Code && c.content.len() <= 80));
        assert_eq!(reassemble(&chunks), source);
    }
}
