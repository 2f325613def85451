//! Symbol-aligned code chunking.
//!
//! Each extracted symbol becomes one chunk whose content is exactly the
//! symbol's lines. Neighbouring symbols contribute a slice of context
//! (`overlap_prev` / `overlap_next`) so a chunk can be understood on its
//! own. Files without usable symbols are cut into fixed-size character
//! windows instead.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use sift_config::ChunkingConfig;
use uuid::Uuid;

use crate::parser::{Symbol, SymbolKind, Visibility};
use crate::scanner::hash_bytes;

/// Namespace for chunk ids (UUIDv5).
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b9e_8d4a_5c3f_a1e7_0b2d_9c84_3e51);

/// A chunk of code extracted from a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub chunk_id: Uuid,
    /// Path relative to the project root.
    pub file_path: String,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub content: String,
    pub symbol_name: Option<String>,
    pub symbol_kind: Option<SymbolKind>,
    pub visibility: Option<Visibility>,
    pub docstring: Option<String>,
    /// Enclosing impl / class, e.g. `Point` for a method of `impl Point`.
    pub parent: Option<String>,
    pub imports: Vec<String>,
    pub calls: Vec<String>,
    pub type_references: BTreeSet<String>,
    pub overlap_prev: Option<String>,
    pub overlap_next: Option<String>,
}

impl CodeChunk {
    /// Deterministic id from the file, the symbol name and the hash of the
    /// chunk's indexed text. Line numbers are not part of it, so a chunk
    /// keeps its id when code above it moves. `occurrence` only separates
    /// otherwise identical chunks of one file.
    pub fn make_id(
        file_path: &str,
        symbol_name: Option<&str>,
        text: &str,
        occurrence: usize,
    ) -> Uuid {
        let mut name = format!(
            "{}\0{}\0{}",
            file_path,
            symbol_name.unwrap_or_default(),
            hash_bytes(text.as_bytes())
        );
        if occurrence > 0 {
            name.push_str(&format!("\0{occurrence}"));
        }
        Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes())
    }

    /// Text sent to the embedding model: the content with its file, scope
    /// and docs prepended.
    pub fn embedding_text(&self) -> String {
        let mut enriched = format!("# File: {}\n", self.file_path);
        if let (Some(kind), Some(name)) = (&self.symbol_kind, &self.symbol_name) {
            enriched.push_str(&format!("# {}: {}\n", kind, name));
        }
        if let Some(parent) = &self.parent {
            enriched.push_str(&format!("# Scope: {}\n", parent));
        }
        if let Some(doc) = &self.docstring {
            enriched.push_str(&format!("# Doc: {}\n", doc));
        }
        enriched.push('\n');
        enriched.push_str(&self.content);
        enriched
    }

    pub fn line_range(&self) -> (usize, usize) {
        (self.start_line, self.end_line)
    }
}

/// Turns a file and its symbols into [`CodeChunk`]s.
#[derive(Debug, Clone)]
pub struct SymbolChunker {
    config: ChunkingConfig,
}

impl Default for SymbolChunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

/// A symbol span resolved against the file's lines.
struct Span<'a> {
    symbol: &'a Symbol,
    start_line: usize,
    end_line: usize,
    content: &'a str,
}

impl SymbolChunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk `content`. One chunk per usable symbol, in file order; the
    /// fixed-size fallback when no symbol is usable.
    pub fn chunk(&self, file_path: &str, content: &str, symbols: &[Symbol]) -> Vec<CodeChunk> {
        if content.is_empty() {
            return Vec::new();
        }
        let lines = LineIndex::new(content);

        let mut ordered: Vec<&Symbol> = symbols.iter().collect();
        ordered.sort_by(|a, b| {
            a.start_line
                .cmp(&b.start_line)
                .then(b.end_line.cmp(&a.end_line))
        });

        let spans: Vec<Span<'_>> = ordered
            .into_iter()
            .filter_map(|symbol| {
                let start = symbol.start_line.max(1);
                let end = symbol.end_line.min(lines.line_count());
                if start > end {
                    return None;
                }
                let slice = lines.slice(start, end).trim_end_matches(['\n', '\r']);
                if slice.trim().is_empty() {
                    return None;
                }
                Some(Span {
                    symbol,
                    start_line: start,
                    end_line: end,
                    content: slice,
                })
            })
            .collect();

        if spans.is_empty() {
            return self.fallback(file_path, content, &lines);
        }

        let fraction = self.config.overlap_fraction;
        let mut chunks: Vec<CodeChunk> = spans
            .iter()
            .enumerate()
            .map(|(ordinal, span)| {
                let symbol = span.symbol;
                let overlap_prev = ordinal
                    .checked_sub(1)
                    .and_then(|i| spans.get(i))
                    .and_then(|prev| tail_chars(prev.content, fraction));
                let overlap_next = spans
                    .get(ordinal + 1)
                    .and_then(|next| head_chars(next.content, fraction));

                CodeChunk {
                    chunk_id: Uuid::nil(),
                    file_path: file_path.to_string(),
                    start_line: span.start_line,
                    end_line: span.end_line,
                    content: span.content.to_string(),
                    symbol_name: Some(symbol.name.clone()),
                    symbol_kind: Some(symbol.kind),
                    visibility: symbol.visibility,
                    docstring: symbol.docstring.clone(),
                    parent: symbol.parent.clone(),
                    imports: symbol
                        .imports
                        .iter()
                        .take(self.config.max_imports)
                        .cloned()
                        .collect(),
                    calls: symbol
                        .calls
                        .iter()
                        .take(self.config.max_calls)
                        .cloned()
                        .collect(),
                    type_references: type_references(span.content, self.config.max_type_references),
                    overlap_prev,
                    overlap_next,
                }
            })
            .collect();
        assign_ids(&mut chunks);
        chunks
    }

    /// Fixed-size character windows with overlap. A window ends just after
    /// a newline when one falls in its last quarter.
    fn fallback(&self, file_path: &str, content: &str, lines: &LineIndex) -> Vec<CodeChunk> {
        let window = self.config.fallback_chunk_chars.max(1);
        let overlap = self.config.fallback_overlap_chars.min(window - 1);

        // Byte offset of every char, plus the end.
        let mut offsets: Vec<usize> = content.char_indices().map(|(i, _)| i).collect();
        let total = offsets.len();
        offsets.push(content.len());

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < total {
            let mut end = (start + window).min(total);
            if end < total {
                let snap_from = end - window / 4;
                if let Some(newline) = (snap_from..end).rev().find(|&i| {
                    content.as_bytes()[offsets[i]] == b'\n'
                }) {
                    end = newline + 1;
                }
            }

            let (from, to) = (offsets[start], offsets[end]);
            let segment = &content[from..to];
            let start_line = lines.line_of(from);
            let end_line = lines.line_of(to - 1).max(start_line);
            chunks.push(CodeChunk {
                chunk_id: Uuid::nil(),
                file_path: file_path.to_string(),
                start_line,
                end_line,
                content: segment.to_string(),
                symbol_name: None,
                symbol_kind: None,
                visibility: None,
                docstring: None,
                parent: None,
                imports: Vec::new(),
                calls: Vec::new(),
                type_references: type_references(segment, self.config.max_type_references),
                overlap_prev: None,
                overlap_next: None,
            });

            if end >= total {
                break;
            }
            start = end.saturating_sub(overlap).max(start + 1);
        }
        assign_ids(&mut chunks);
        chunks
    }
}

/// Give every chunk its content-derived id, numbering repeats in file order.
fn assign_ids(chunks: &mut [CodeChunk]) {
    let mut seen: HashMap<Uuid, usize> = HashMap::new();
    for chunk in chunks {
        let text = chunk.embedding_text();
        let key = |occurrence| {
            CodeChunk::make_id(&chunk.file_path, chunk.symbol_name.as_deref(), &text, occurrence)
        };
        let base = key(0);
        let occurrence = seen.entry(base).or_insert(0);
        let id = key(*occurrence);
        *occurrence += 1;
        chunk.chunk_id = id;
    }
}

/// Byte offsets of line starts.
struct LineIndex<'a> {
    content: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(content: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            content
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1)
                .filter(|&i| i < content.len()),
        );
        Self { content, starts }
    }

    fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Text of lines `start..=end` (1-indexed).
    fn slice(&self, start: usize, end: usize) -> &'a str {
        let from = self.starts[start - 1];
        let to = self.starts.get(end).copied().unwrap_or(self.content.len());
        &self.content[from..to]
    }

    /// 1-indexed line containing byte `offset`.
    fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&s| s <= offset).max(1)
    }
}

fn overlap_len(text: &str, fraction: f32) -> usize {
    let chars = text.chars().count();
    ((chars as f32) * fraction).round() as usize
}

/// Trailing `fraction` of `text`, by chars.
fn tail_chars(text: &str, fraction: f32) -> Option<String> {
    let n = overlap_len(text, fraction);
    if n == 0 {
        return None;
    }
    let skip = text.chars().count().saturating_sub(n);
    Some(text.chars().skip(skip).collect())
}

/// Leading `fraction` of `text`, by chars.
fn head_chars(text: &str, fraction: f32) -> Option<String> {
    let n = overlap_len(text, fraction);
    if n == 0 {
        return None;
    }
    Some(text.chars().take(n).collect())
}

/// CamelCase identifiers in `text`: an uppercase first letter and at least
/// one lowercase letter, so `SCREAMING_CASE` constants are left out.
fn type_references(text: &str, limit: usize) -> BTreeSet<String> {
    let all: BTreeSet<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| {
            word.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
                && word.chars().any(|c| c.is_ascii_lowercase())
                && !word.contains('_')
        })
        .map(str::to_string)
        .collect();
    all.into_iter().take(limit).collect()
}
