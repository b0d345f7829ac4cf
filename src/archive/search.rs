use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1, Axis};
use rusqlite::{params, Connection};
use serde::Deserialize;

use super::bytes_to_embedding;
use super::types::{ArchiveKind, ArchiveStatus, SearchResult};

// ── Public types ──────────────────────────────────────────────────────────────

/// Which chunk vector stands in for a multi-chunk archive during ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentativePolicy {
    /// Only chunk 0. One vector per archive, cheapest.
    #[default]
    FirstChunk,
    /// Max similarity over every chunk of the archive.
    BestChunk,
}

/// A search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub k: usize,
    pub kind: Option<ArchiveKind>,
    pub status: Option<ArchiveStatus>,
    pub min_score: f32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            kind: None,
            status: None,
            min_score: 0.1,
        }
    }

    pub fn with_kind(mut self, kind: ArchiveKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: ArchiveStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

// Ranking weights.
const SIMILARITY_WEIGHT: f32 = 0.7;
const LEXICAL_WEIGHT: f32 = 0.3;
const RECENCY_WEIGHT: f32 = 0.05;

const EXCERPT_WINDOW_CHARS: usize = 300;
const EXCERPT_MAX_CHARS: usize = 256;
/// Context kept before the first matched term in an excerpt window.
const EXCERPT_LEAD_CHARS: usize = 40;

// ── Internal row struct for candidates ────────────────────────────────────────

struct Candidate {
    task_id: String,
    title: String,
    kind: ArchiveKind,
    status: Option<ArchiveStatus>,
    completed_at: Option<String>,
    filepath: Option<String>,
    similarity: f32,
    /// Byte offset of the representative chunk.
    position: usize,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Vector + lexical hybrid search. `query_vector` must be a real embedding;
/// callers route the zero-vector sentinel to [`lexical_search`].
pub fn hybrid_search(
    conn: &Connection,
    query_vector: &[f32],
    query: &SearchQuery,
    policy: RepresentativePolicy,
    fts: bool,
) -> Result<Vec<SearchResult>> {
    if query.k == 0 {
        return Ok(Vec::new());
    }

    // 1. Representative vectors, restricted by filters
    let rows = fetch_chunk_vectors(conn, query, policy)?;
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    // 2. One batched similarity pass
    let vectors: Vec<Vec<f32>> = rows.iter().map(|r| bytes_to_embedding(&r.vector)).collect();
    let scores = batch_cosine_similarity(query_vector, &vectors);

    // 3. Collapse to one candidate per archive (a no-op for FirstChunk)
    let mut by_id: HashMap<String, Candidate> = HashMap::new();
    for (row, similarity) in rows.into_iter().zip(scores) {
        match by_id.get_mut(&row.task_id) {
            Some(existing) if existing.similarity >= similarity => {}
            Some(existing) => {
                existing.similarity = similarity;
                existing.position = row.position;
            }
            None => {
                by_id.insert(
                    row.task_id.clone(),
                    Candidate {
                        task_id: row.task_id,
                        title: row.title,
                        kind: row.kind,
                        status: row.status,
                        completed_at: row.completed_at,
                        filepath: row.filepath,
                        similarity,
                        position: row.position,
                    },
                );
            }
        }
    }
    let candidates: Vec<Candidate> = by_id
        .into_values()
        .filter(|c| c.similarity >= query.min_score)
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    // 4. Hybrid score
    let lexical = if fts {
        fts_scores(conn, &query.text)?
    } else {
        HashMap::new()
    };
    let now = Utc::now();
    let mut scored: Vec<(Candidate, f32)> = candidates
        .into_iter()
        .map(|c| {
            let lex = lexical.get(&c.task_id).copied().unwrap_or(0.0);
            let days = c.completed_at.as_deref().and_then(|ts| days_since(ts, now));
            let score = hybrid_score(c.similarity, lex, days, c.kind);
            (c, score)
        })
        .collect();

    // 5. Top k, then excerpts for the survivors only
    scored.sort_by(|a, b| rank_order(a.1, &a.0.completed_at, b.1, &b.0.completed_at));
    scored.truncate(query.k);

    let ids: Vec<&str> = scored.iter().map(|(c, _)| c.task_id.as_str()).collect();
    let contents = fetch_contents(conn, &ids)?;
    let terms = query_terms(&query.text);

    Ok(scored
        .into_iter()
        .map(|(c, score)| {
            let excerpt = contents
                .get(&c.task_id)
                .map(|content| excerpt(content, &terms, c.position))
                .unwrap_or_default();
            SearchResult {
                task_id: c.task_id,
                title: c.title,
                score,
                excerpt,
                kind: c.kind,
                status: c.status,
                completed_at: c.completed_at,
                filepath: c.filepath,
            }
        })
        .collect())
}

/// Lexical-only search used when no query embedding is available.
///
/// With FTS: BM25 matches, scored by normalized rank. Without: substring match
/// on title, scored 1.0. Either way results are ordered by completion recency.
pub fn lexical_search(conn: &Connection, query: &SearchQuery, fts: bool) -> Result<Vec<SearchResult>> {
    if query.k == 0 || query.text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let kind = query.kind.map(|k| k.as_str());
    let status = query.status.map(|s| s.as_str());
    let results = if fts {
        let escaped = escape_fts_query(&query.text);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT a.task_id, a.title, a.kind, a.status, a.completed_at, a.filepath, a.content, \
             bm25(archives_fts) \
             FROM archives_fts JOIN archives a ON a.task_id = archives_fts.task_id \
             WHERE archives_fts MATCH ?1 \
             AND (?2 IS NULL OR a.kind = ?2) AND (?3 IS NULL OR a.status = ?3) \
             ORDER BY a.completed_at IS NULL, a.completed_at DESC, a.updated_at DESC \
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![escaped, kind, status, query.k as i64], |row| {
                Ok((lexical_row(row)?, row.get::<_, f64>(7)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut row, rank)| {
                row.score = normalize_rank(rank);
                row
            })
            .collect::<Vec<_>>()
    } else {
        let pattern = format!("%{}%", escape_like(query.text.trim()));
        let mut stmt = conn.prepare(
            "SELECT task_id, title, kind, status, completed_at, filepath, content \
             FROM archives \
             WHERE title LIKE ?1 ESCAPE '\\' \
             AND (?2 IS NULL OR kind = ?2) AND (?3 IS NULL OR status = ?3) \
             ORDER BY completed_at IS NULL, completed_at DESC, updated_at DESC \
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![pattern, kind, status, query.k as i64], lexical_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let terms = query_terms(&query.text);
    Ok(results
        .into_iter()
        .map(|row| SearchResult {
            excerpt: excerpt(&row.content, &terms, 0),
            task_id: row.task_id,
            title: row.title,
            score: row.score,
            kind: row.kind,
            status: row.status,
            completed_at: row.completed_at,
            filepath: row.filepath,
        })
        .collect())
}

/// Cosine similarity. Zero-norm or mismatched inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Similarity of `query` against every candidate in one matrix product.
/// Returns exactly one score per candidate, in order.
pub fn batch_cosine_similarity(query: &[f32], candidates: &[Vec<f32>]) -> Vec<f32> {
    let n = candidates.len();
    let dim = query.len();
    let q = ArrayView1::from(query);
    let q_norm = q.dot(&q).sqrt();
    if n == 0 || dim == 0 || q_norm <= 0.0 {
        return vec![0.0; n];
    }

    let mut flat = Vec::with_capacity(n * dim);
    for c in candidates {
        if c.len() == dim {
            flat.extend_from_slice(c);
        } else {
            // Wrong dimensionality: a zero row scores 0.
            flat.extend(std::iter::repeat(0.0).take(dim));
        }
    }
    let matrix = match Array2::from_shape_vec((n, dim), flat) {
        Ok(m) => m,
        Err(_) => return candidates.iter().map(|c| cosine_similarity(query, c)).collect(),
    };

    let dots = matrix.dot(&q);
    let norms = matrix.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    dots.iter()
        .zip(norms.iter())
        .map(|(dot, norm)| {
            if *norm <= 0.0 {
                0.0
            } else {
                (dot / (norm * q_norm)).clamp(-1.0, 1.0)
            }
        })
        .collect()
}

/// `(0.7·sim + 0.3·lex − 0.05·ln(1 + days)) × kind weight`, clamped to `[0, 1]`.
pub fn hybrid_score(similarity: f32, lexical: f32, days_since_completion: Option<f64>, kind: ArchiveKind) -> f32 {
    let recency = days_since_completion
        .map(|d| RECENCY_WEIGHT * (1.0 + d.max(0.0) as f32).ln())
        .unwrap_or(0.0);
    let raw = (SIMILARITY_WEIGHT * similarity + LEXICAL_WEIGHT * lexical - recency) * kind.weight();
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word becomes a quoted term; terms are OR-ed so
/// partial matches still contribute a lexical score.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Contextual excerpt: the window with the most query-term hits, whitespace
/// normalized and capped at 256 chars. Without any hit, the window starts at
/// `fallback_offset` (the representative chunk).
pub fn excerpt(content: &str, terms: &[String], fallback_offset: usize) -> String {
    let haystack = content.to_ascii_lowercase();

    let mut best: Option<(usize, usize)> = None; // (hits, start)
    for term in terms {
        for (pos, _) in haystack.match_indices(term.as_str()) {
            let start = back_off(content, pos, EXCERPT_LEAD_CHARS);
            let end = advance(content, start, EXCERPT_WINDOW_CHARS);
            let window = &haystack[start..end];
            let hits: usize = terms.iter().map(|t| window.matches(t.as_str()).count()).sum();
            if best.is_none_or(|(h, _)| hits > h) {
                best = Some((hits, start));
            }
        }
    }

    let start = match best {
        Some((_, start)) => start,
        None => floor_char_boundary(content, fallback_offset.min(content.len())),
    };
    let end = advance(content, start, EXCERPT_WINDOW_CHARS);
    let normalized = content[start..end].split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&normalized, EXCERPT_MAX_CHARS)
}

// ── Internal helpers ──────────────────────────────────────────────────────────

struct ChunkRow {
    task_id: String,
    title: String,
    kind: ArchiveKind,
    status: Option<ArchiveStatus>,
    completed_at: Option<String>,
    filepath: Option<String>,
    vector: Vec<u8>,
    position: usize,
}

struct LexicalRow {
    task_id: String,
    title: String,
    kind: ArchiveKind,
    status: Option<ArchiveStatus>,
    completed_at: Option<String>,
    filepath: Option<String>,
    content: String,
    score: f32,
}

fn fetch_chunk_vectors(
    conn: &Connection,
    query: &SearchQuery,
    policy: RepresentativePolicy,
) -> Result<Vec<ChunkRow>> {
    let chunk_filter = match policy {
        RepresentativePolicy::FirstChunk => "AND e.chunk_id = 0",
        RepresentativePolicy::BestChunk => "",
    };
    let sql = format!(
        "SELECT a.task_id, a.title, a.kind, a.status, a.completed_at, a.filepath, \
         e.vector, e.position \
         FROM archives a JOIN embeddings e ON e.task_id = a.task_id \
         WHERE (?1 IS NULL OR a.kind = ?1) AND (?2 IS NULL OR a.status = ?2) {chunk_filter}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![query.kind.map(|k| k.as_str()), query.status.map(|s| s.as_str())],
            |row| {
                Ok(ChunkRow {
                    task_id: row.get(0)?,
                    title: row.get(1)?,
                    kind: parse_kind(row.get::<_, String>(2)?),
                    status: parse_status(row.get(3)?),
                    completed_at: row.get(4)?,
                    filepath: row.get(5)?,
                    vector: row.get(6)?,
                    position: row.get::<_, i64>(7)?.max(0) as usize,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// task_id → BM25 rank normalized into `[0, 1)`.
fn fts_scores(conn: &Connection, query_text: &str) -> Result<HashMap<String, f32>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(HashMap::new());
    }
    let mut stmt = conn.prepare(
        "SELECT task_id, bm25(archives_fts) FROM archives_fts WHERE archives_fts MATCH ?1",
    )?;
    let scores = stmt
        .query_map(params![escaped], |row| {
            Ok((row.get::<_, String>(0)?, normalize_rank(row.get(1)?)))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(scores)
}

/// FTS5 rank is negative (more negative = better). Map `s = -rank` to
/// `s / (1 + s)`.
fn normalize_rank(rank: f64) -> f32 {
    let s = (-rank).max(0.0);
    (s / (1.0 + s)) as f32
}

fn fetch_contents(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, String>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT task_id, content FROM archives WHERE task_id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

fn lexical_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LexicalRow> {
    Ok(LexicalRow {
        task_id: row.get(0)?,
        title: row.get(1)?,
        kind: parse_kind(row.get::<_, String>(2)?),
        status: parse_status(row.get(3)?),
        completed_at: row.get(4)?,
        filepath: row.get(5)?,
        content: row.get(6)?,
        score: 1.0,
    })
}

// The CHECK constraints keep these columns valid; anything else is legacy data.
fn parse_kind(raw: String) -> ArchiveKind {
    raw.parse().unwrap_or(ArchiveKind::Archive)
}

fn parse_status(raw: Option<String>) -> Option<ArchiveStatus> {
    raw.and_then(|s| s.parse().ok())
}

/// Descending score, ties broken by more recent `completed_at` (missing last).
fn rank_order(a_score: f32, a_completed: &Option<String>, b_score: f32, b_completed: &Option<String>) -> Ordering {
    b_score
        .partial_cmp(&a_score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| match (a_completed, b_completed) {
            (Some(a), Some(b)) => b.cmp(a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

fn days_since(timestamp: &str, now: DateTime<Utc>) -> Option<f64> {
    let then = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let secs = (now - then.with_timezone(&Utc)).num_seconds().max(0);
    Some(secs as f64 / 86_400.0)
}

/// Lowercase alphanumeric query terms, deduplicated.
fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for t in query.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let t = t.to_ascii_lowercase();
        if !t.is_empty() && !terms.contains(&t) {
            terms.push(t);
        }
    }
    terms
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Byte index `n` chars before `pos` (or 0).
fn back_off(s: &str, pos: usize, n: usize) -> usize {
    s[..pos]
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Byte index `n` chars after `start` (or the end).
fn advance(s: &str, start: usize, n: usize) -> usize {
    s[start..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| start + i)
        .unwrap_or(s.len())
}

/// Cap `s` at `max_chars`, ellipsis included.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    const ELLIPSIS: &str = "...";
    if s.chars().nth(max_chars).is_none() {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
    format!("{}{ELLIPSIS}", s[..end].trim_end())
}
