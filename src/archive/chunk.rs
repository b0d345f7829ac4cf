//! Preprocessing and paragraph-boundary chunking.
//!
//! [`preprocess`] strips formatting noise before embedding. [`chunk`] splits
//! raw text into bounded slices on paragraph boundaries, falling back to
//! sentence boundaries (and finally whitespace) for oversized paragraphs.
//! Every chunk is a slice of the input, so its recorded offset is exact.
//! Both functions are pure and never fail.

use std::sync::LazyLock;

use regex::Regex;

/// Default maximum chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+").expect("valid regex"));
static STRONG_STAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(\S(?:.*?\S)?)\*\*").expect("valid regex"));
static STRONG_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b__(\S(?:.*?\S)?)__\b").expect("valid regex"));
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(\S(?:[^*]*?\S)?)\*").expect("valid regex"));
static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t\r]*\n\s*").expect("valid regex"));

/// A chunk of source text and the byte offset of its first character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub start: usize,
}

/// Strip a leading front-matter block, heading markers and emphasis, and
/// collapse whitespace inside each line. Blank lines survive (collapsed to
/// one) so paragraph structure is preserved.
pub fn preprocess(text: &str) -> String {
    let body = strip_front_matter(text);

    let mut out = String::with_capacity(body.len());
    let mut blank_run = false;
    for line in body.lines() {
        let line = HEADING.replace(line, "");
        let line = STRONG_STAR.replace_all(&line, "$1");
        let line = STRONG_UNDERSCORE.replace_all(&line, "$1");
        let line = EMPHASIS.replace_all(&line, "$1");
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

        if collapsed.is_empty() {
            if !blank_run && !out.is_empty() {
                out.push('\n');
            }
            blank_run = true;
            continue;
        }
        blank_run = false;
        out.push_str(&collapsed);
        out.push('\n');
    }

    out.trim_end().to_string()
}

/// Return the text after a leading `---` front-matter block. An unterminated
/// block is not front matter and the text is returned unchanged.
pub fn strip_front_matter(text: &str) -> &str {
    front_matter_split(text).map(|(_, body)| body).unwrap_or(text)
}

/// Split `(front_matter_body, rest)` when the text opens with a `---` block.
pub fn front_matter_split(text: &str) -> Option<(&str, &str)> {
    let trimmed = text.trim_start_matches('\u{feff}');
    let rest = trimmed
        .strip_prefix("---\n")
        .or_else(|| trimmed.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let fm = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((fm, body));
        }
        offset += line.len();
    }
    None
}

/// Split `text` into chunks of at most `max_size` bytes.
///
/// Text within the limit comes back as a single chunk at offset 0.
pub fn chunk(text: &str, max_size: usize) -> Vec<TextChunk> {
    let max_size = max_size.max(1);
    if text.len() <= max_size {
        return vec![TextChunk {
            text: text.to_string(),
            start: 0,
        }];
    }

    let mut units: Vec<(usize, usize)> = Vec::new();
    for (start, end) in paragraph_spans(text) {
        if end - start <= max_size {
            units.push((start, end));
            continue;
        }
        for (s, e) in sentence_spans(text, start, end) {
            if e - s <= max_size {
                units.push((s, e));
            } else {
                units.extend(hard_split(text, s, e, max_size));
            }
        }
    }

    let mut chunks = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (s, e) in units {
        current = match current {
            Some((cs, _)) if e - cs <= max_size => Some((cs, e)),
            Some((cs, ce)) => {
                chunks.push(make_chunk(text, cs, ce));
                Some((s, e))
            }
            None => Some((s, e)),
        };
    }
    if let Some((cs, ce)) = current {
        chunks.push(make_chunk(text, cs, ce));
    }

    if chunks.is_empty() {
        chunks.push(TextChunk {
            text: text.to_string(),
            start: 0,
        });
    }
    chunks
}

fn make_chunk(text: &str, start: usize, end: usize) -> TextChunk {
    TextChunk {
        text: text[start..end].to_string(),
        start,
    }
}

/// Non-blank paragraph spans, trimmed of surrounding whitespace.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    for sep in PARAGRAPH_BREAK.find_iter(text) {
        push_trimmed(text, cursor, sep.start(), &mut spans);
        cursor = sep.end();
    }
    push_trimmed(text, cursor, text.len(), &mut spans);
    spans
}

/// Sentence spans inside `[start, end)`: a boundary follows `.`, `!` or `?`
/// plus whitespace, or any newline.
fn sentence_spans(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut spans = Vec::new();
    let mut sentence_start = 0;
    let mut prev: Option<char> = None;

    for (i, c) in slice.char_indices() {
        let boundary = c == '\n' || (c.is_whitespace() && matches!(prev, Some('.' | '!' | '?')));
        if boundary {
            push_trimmed(text, start + sentence_start, start + i, &mut spans);
            sentence_start = i + c.len_utf8();
        }
        prev = Some(c);
    }
    push_trimmed(text, start + sentence_start, end, &mut spans);
    spans
}

/// Cut an oversized span into pieces of at most `max_size` bytes, preferring
/// whitespace and always landing on char boundaries.
fn hard_split(text: &str, start: usize, end: usize, max_size: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut pos = start;
    while pos < end {
        if end - pos <= max_size {
            push_trimmed(text, pos, end, &mut pieces);
            break;
        }
        let mut cut = pos + max_size;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(ws) = text[pos..cut].rfind(char::is_whitespace) {
            if ws > 0 {
                cut = pos + ws;
            }
        }
        if cut == pos {
            // A single char wider than max_size: take it whole.
            cut = pos + text[pos..].chars().next().map(char::len_utf8).unwrap_or(1);
        }
        push_trimmed(text, pos, cut, &mut pieces);
        pos = cut;
    }
    pieces
}

fn push_trimmed(text: &str, start: usize, end: usize, spans: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if !trimmed.is_empty() {
        spans.push((start + lead, start + lead + trimmed.len()));
    }
}
