//! BM25 keyword search over chunk fields, built on tantivy.
//!
//! Each chunk is one document with three boosted text fields (content,
//! symbol name, docstring) and a raw `chunk_id` key used for deletes.
//! Text is split by [`tokenize`] before it reaches tantivy, so identifiers
//! are searchable whole and by their parts.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sift_config::SearchConfig;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::tokenizer::{RemoveLongFilter, TextAnalyzer, WhitespaceTokenizer};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;
use uuid::Uuid;

use super::RankedHit;
use crate::chunker::CodeChunk;
use crate::detector::join_error;
use crate::error::{IndexError, Result};

const TOKENIZER: &str = "code";
const WRITER_MEMORY: usize = 20_000_000;

/// Keyword index over chunks.
///
/// Every method is a potential I/O boundary; callers must not hold locks
/// across these calls.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Index (or re-index) a chunk.
    async fn insert(&self, chunk_id: Uuid, fields: LexicalFields) -> Result<()>;

    async fn delete(&self, chunk_id: Uuid) -> Result<()>;

    /// Best matches first, rank 1-indexed, score non-increasing.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedHit>>;

    async fn insert_batch(&self, entries: Vec<(Uuid, LexicalFields)>) -> Result<()> {
        for (id, fields) in entries {
            self.insert(id, fields).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        for id in ids {
            self.delete(*id).await?;
        }
        Ok(())
    }

    /// Make the index durable.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// The searchable text of one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LexicalFields {
    pub content: String,
    pub symbol_name: Option<String>,
    pub docstring: Option<String>,
}

impl From<&CodeChunk> for LexicalFields {
    fn from(chunk: &CodeChunk) -> Self {
        Self {
            content: chunk.content.clone(),
            symbol_name: chunk.symbol_name.clone(),
            docstring: chunk.docstring.clone(),
        }
    }
}

/// Per-field score multipliers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldBoosts {
    pub content: f64,
    pub symbol_name: f64,
    pub docstring: f64,
}

impl Default for FieldBoosts {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for FieldBoosts {
    fn from(config: &SearchConfig) -> Self {
        Self {
            content: config.content_boost,
            symbol_name: config.symbol_name_boost,
            docstring: config.docstring_boost,
        }
    }
}

/// Split text into lowercase search terms.
///
/// Identifiers are kept whole and also split into their `snake_case` and
/// `camelCase` parts, so `parseConfig` matches a query for `parse config`.
/// Single-character terms are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
    {
        let whole = word.to_lowercase();
        let parts: Vec<String> = word
            .split('_')
            .flat_map(camel_parts)
            .map(|p| p.to_lowercase())
            .filter(|p| p.chars().count() > 1)
            .collect();

        if whole.trim_matches('_').chars().count() > 1 {
            tokens.push(whole.clone());
        }
        if parts.len() > 1 || parts.first().map(|p| *p != whole).unwrap_or(false) {
            tokens.extend(parts);
        }
    }
    tokens
}

/// `parseHTTPRequest` -> `parse`, `HTTP`, `Request`.
fn camel_parts(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;
    for i in 1..chars.len() {
        let (idx, c) = chars[i];
        let prev = chars[i - 1].1;
        let next_lower = chars.get(i + 1).map(|(_, n)| n.is_lowercase()).unwrap_or(false);
        let boundary = ((prev.is_lowercase() || prev.is_ascii_digit()) && c.is_uppercase())
            || (prev.is_uppercase() && c.is_uppercase() && next_lower);
        if boundary {
            parts.push(&word[start..idx]);
            start = idx;
        }
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

struct Fields {
    chunk_id: Field,
    content: Field,
    symbol_name: Field,
    docstring: Field,
}

fn build_schema() -> (Schema, Fields) {
    let text = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqs),
    );
    let mut builder = Schema::builder();
    let fields = Fields {
        chunk_id: builder.add_text_field("chunk_id", STRING | STORED),
        content: builder.add_text_field("content", text.clone()),
        symbol_name: builder.add_text_field("symbol_name", text.clone()),
        docstring: builder.add_text_field("docstring", text),
    };
    (builder.build(), fields)
}

struct Inner {
    fields: Fields,
    boosts: FieldBoosts,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
}

impl Inner {
    fn document(&self, chunk_id: Uuid, fields: &LexicalFields) -> TantivyDocument {
        let mut doc = TantivyDocument::default();
        doc.add_text(self.fields.chunk_id, chunk_id.to_string());
        doc.add_text(self.fields.content, tokenize(&fields.content).join(" "));
        if let Some(name) = &fields.symbol_name {
            doc.add_text(self.fields.symbol_name, tokenize(name).join(" "));
        }
        if let Some(docstring) = &fields.docstring {
            doc.add_text(self.fields.docstring, tokenize(docstring).join(" "));
        }
        doc
    }

    fn id_term(&self, chunk_id: Uuid) -> Term {
        Term::from_field_text(self.fields.chunk_id, &chunk_id.to_string())
    }

    /// Apply deletes then adds as one commit, so readers see all of it or
    /// none of it.
    fn apply(&self, deletes: &[Uuid], adds: &[(Uuid, LexicalFields)]) -> Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| IndexError::write("lexical", "writer lock poisoned"))?;

        for id in deletes.iter().chain(adds.iter().map(|(id, _)| id)) {
            writer.delete_term(self.id_term(*id));
        }
        for (id, fields) in adds {
            if let Err(e) = writer.add_document(self.document(*id, fields)) {
                let _ = writer.rollback();
                return Err(IndexError::write("lexical", e));
            }
        }
        if let Err(e) = writer.commit() {
            let _ = writer.rollback();
            return Err(IndexError::write("lexical", e));
        }
        self.reader
            .reload()
            .map_err(|e| IndexError::write("lexical", e))
    }

    fn query(&self, terms: &BTreeSet<String>) -> BooleanQuery {
        let weighted = [
            (self.fields.content, self.boosts.content),
            (self.fields.symbol_name, self.boosts.symbol_name),
            (self.fields.docstring, self.boosts.docstring),
        ];
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for term in terms {
            for (field, boost) in weighted {
                if boost <= 0.0 {
                    continue;
                }
                let query = TermQuery::new(
                    Term::from_field_text(field, term),
                    IndexRecordOption::WithFreqs,
                );
                clauses.push((Occur::Should, Box::new(BoostQuery::new(Box::new(query), boost as f32))));
            }
        }
        BooleanQuery::new(clauses)
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedHit>> {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let backend_error = |e: tantivy::TantivyError| IndexError::QueryBackend {
            backend: "lexical",
            reason: e.to_string(),
        };

        let searcher = self.reader.searcher();
        // Over-fetch so equal scores at the cut-off are ordered by id.
        let top_docs = searcher
            .search(&self.query(&terms), &TopDocs::with_limit(limit * 2 + 8))
            .map_err(backend_error)?;

        let mut scored = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address).map_err(backend_error)?;
            let Some(id) = doc
                .get_first(self.fields.chunk_id)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            scored.push((id, f64::from(score)));
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (chunk_id, score))| RankedHit {
                chunk_id,
                rank: i + 1,
                score,
            })
            .collect())
    }
}

/// Tantivy-backed BM25 index, in RAM or in a directory.
#[derive(Clone)]
pub struct Bm25Index {
    inner: Arc<Inner>,
}

impl Bm25Index {
    /// An index held in RAM.
    pub fn in_memory(boosts: FieldBoosts) -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields, boosts)
    }

    /// Open the index in directory `path`, creating it if needed.
    pub async fn open(path: impl AsRef<Path>, boosts: FieldBoosts) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(IndexError::store)?;

        tokio::task::spawn_blocking(move || {
            let (schema, fields) = build_schema();
            let directory = MmapDirectory::open(&path)
                .map_err(|e| IndexError::store(format!("{}: {e}", path.display())))?;
            let index = Index::open_or_create(directory, schema)
                .map_err(|e| IndexError::store(format!("{}: {e}", path.display())))?;
            let opened = Self::from_index(index, fields, boosts)?;
            debug!("Opened lexical index at {:?} with {} chunks", path, opened.count());
            Ok(opened)
        })
        .await
        .map_err(join_error)?
    }

    fn from_index(index: Index, fields: Fields, boosts: FieldBoosts) -> Result<Self> {
        index.tokenizers().register(
            TOKENIZER,
            TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(RemoveLongFilter::limit(64))
                .build(),
        );
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_MEMORY)
            .map_err(IndexError::store)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(IndexError::store)?;

        Ok(Self {
            inner: Arc::new(Inner {
                fields,
                boosts,
                reader,
                writer: Mutex::new(writer),
            }),
        })
    }

    fn count(&self) -> usize {
        self.inner.reader.searcher().num_docs() as usize
    }

    /// Number of committed chunks.
    pub async fn len(&self) -> usize {
        self.count()
    }

    pub async fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub async fn contains(&self, chunk_id: Uuid) -> bool {
        let query = TermQuery::new(self.inner.id_term(chunk_id), IndexRecordOption::Basic);
        self.inner
            .reader
            .searcher()
            .search(&query, &Count)
            .map(|n| n > 0)
            .unwrap_or(false)
    }

    async fn write(&self, deletes: Vec<Uuid>, adds: Vec<(Uuid, LexicalFields)>) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.apply(&deletes, &adds))
            .await
            .map_err(join_error)?
    }
}

#[async_trait]
impl LexicalIndex for Bm25Index {
    async fn insert(&self, chunk_id: Uuid, fields: LexicalFields) -> Result<()> {
        self.write(Vec::new(), vec![(chunk_id, fields)]).await
    }

    async fn delete(&self, chunk_id: Uuid) -> Result<()> {
        self.write(vec![chunk_id], Vec::new()).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedHit>> {
        let inner = self.inner.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || inner.search(&query, limit))
            .await
            .map_err(join_error)?
    }

    async fn insert_batch(&self, entries: Vec<(Uuid, LexicalFields)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write(Vec::new(), entries).await
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.write(ids.to_vec(), Vec::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn content(text: &str) -> LexicalFields {
        LexicalFields {
            content: text.to_string(),
            ..LexicalFields::default()
        }
    }

    fn index() -> Bm25Index {
        Bm25Index::in_memory(FieldBoosts::default()).unwrap()
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Hello, World! This is a test_function.");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"test_function".to_string()));
        assert!(tokens.contains(&"test".to_string()));
        assert!(tokens.contains(&"function".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_tokenize_camel_case() {
        assert_eq!(
            tokenize("parseHTTPRequest"),
            vec!["parsehttprequest", "parse", "http", "request"]
        );
        assert_eq!(tokenize("plain"), vec!["plain"]);
        assert_eq!(tokenize("Config"), vec!["config"]);
    }

    #[test]
    fn test_tokenize_special_characters() {
        let tokens = tokenize("fn main() { let x = 42; }");
        assert_eq!(tokens, vec!["fn", "main", "let", "42"]);
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let index = index();
        index.insert(id(1), content("The quick brown fox")).await.unwrap();
        index.insert(id(2), content("The lazy dog")).await.unwrap();
        index.insert(id(3), content("The quick rabbit")).await.unwrap();

        let results = index.search("quick fox", 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id, id(1));
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[1].rank, 2);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn test_identifier_parts_match() {
        let index = index();
        index
            .insert(id(1), content("fn parseConfigFile(path: &Path) {}"))
            .await
            .unwrap();
        assert_eq!(index.search("config file", 10).await.unwrap().len(), 1);
        assert_eq!(index.search("parseConfigFile", 10).await.unwrap().len(), 1);
        // Query syntax characters are plain text.
        assert_eq!(index.search("parse(config:", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_symbol_name_boost() {
        let index = index();
        index
            .insert(id(1), content("fn helper() { let tokenizer = build(); }"))
            .await
            .unwrap();
        index
            .insert(
                id(2),
                LexicalFields {
                    content: "fn tokenizer() { helper() }".to_string(),
                    symbol_name: Some("tokenizer".to_string()),
                    docstring: None,
                },
            )
            .await
            .unwrap();

        let results = index.search("tokenizer", 10).await.unwrap();
        assert_eq!(results[0].chunk_id, id(2));
    }

    #[tokio::test]
    async fn test_ties_broken_by_chunk_id() {
        let index = index();
        index
            .insert_batch(
                [5u128, 3, 9]
                    .into_iter()
                    .map(|n| (id(n), content("identical text")))
                    .collect(),
            )
            .await
            .unwrap();
        let results = index.search("identical", 10).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.chunk_id).collect();
        assert_eq!(ids, vec![id(3), id(5), id(9)]);
    }

    #[tokio::test]
    async fn test_reinsert_replaces_entry() {
        let index = index();
        index.insert(id(1), content("alpha beta")).await.unwrap();
        index.insert(id(1), content("gamma delta")).await.unwrap();
        assert_eq!(index.len().await, 1);
        assert!(index.search("alpha", 10).await.unwrap().is_empty());
        assert_eq!(index.search("gamma", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_chunk_id() {
        let index = index();
        index.insert(id(1), content("unique term here")).await.unwrap();
        index.insert(id(2), content("different content")).await.unwrap();
        assert!(index.contains(id(1)).await);

        index.delete_batch(&[id(1)]).await.unwrap();
        assert!(index.search("unique", 10).await.unwrap().is_empty());
        assert!(!index.contains(id(1)).await);
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn test_search_ranking_and_limit() {
        let index = index();
        index.insert(id(1), content("rust programming language")).await.unwrap();
        index.insert(id(2), content("rust rust rust")).await.unwrap();
        index.insert(id(3), content("python programming")).await.unwrap();

        let results = index.search("rust", 10).await.unwrap();
        assert_eq!(results[0].chunk_id, id(2));
        assert_eq!(index.search("rust", 1).await.unwrap().len(), 1);
        assert!(index.search("rust", 0).await.unwrap().is_empty());
        assert!(index.search("", 10).await.unwrap().is_empty());
        assert!(index.search("xyz123", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lexical");

        {
            let index = Bm25Index::open(&path, FieldBoosts::default()).await.unwrap();
            index.insert(id(1), content("hello world rust")).await.unwrap();
            index.insert(id(2), content("rust programming language")).await.unwrap();
            index.flush().await.unwrap();
        }

        let loaded = Bm25Index::open(&path, FieldBoosts::default()).await.unwrap();
        assert_eq!(loaded.len().await, 2);
        assert_eq!(loaded.search("rust", 10).await.unwrap().len(), 2);
    }
}
