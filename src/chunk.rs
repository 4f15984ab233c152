//! Document chunking strategies.
//!
//! Every strategy turns plain text into an ordered list of [`Chunk`]s and
//! shares one [`ChunkingConfig`]. Sizes are measured in characters.
//!
//! | Strategy | Boundary |
//! |----------|----------|
//! | `sentence` | Sentence-ending punctuation, with overlap carried forward |
//! | `paragraph` | The configured separator, oversized paragraphs token-packed |
//! | `semantic` | Lines that look like section headers |
//! | `hybrid` | First non-empty of semantic, paragraph, sentence |
//! | `adaptive` | Paragraphs, with a target size scaled by text complexity |
//!
//! For any text with non-whitespace content the result is never empty and
//! chunk order follows reading order.

use std::fmt;
use std::str::FromStr;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ChunkType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategyKind {
    Sentence,
    Paragraph,
    Semantic,
    Hybrid,
    Adaptive,
}

impl ChunkStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategyKind::Sentence => "sentence",
            ChunkStrategyKind::Paragraph => "paragraph",
            ChunkStrategyKind::Semantic => "semantic",
            ChunkStrategyKind::Hybrid => "hybrid",
            ChunkStrategyKind::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for ChunkStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown chunking strategy: '{0}'. Must be sentence, paragraph, semantic, hybrid, or adaptive.")]
pub struct UnknownStrategy(pub String);

impl FromStr for ChunkStrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentence" => Ok(Self::Sentence),
            "paragraph" => Ok(Self::Paragraph),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            "adaptive" => Ok(Self::Adaptive),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// A configured chunking strategy.
#[derive(Debug, Clone)]
pub struct Chunker {
    kind: ChunkStrategyKind,
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(kind: ChunkStrategyKind, config: ChunkingConfig) -> Self {
        Self { kind, config }
    }

    /// Build from config, parsing `config.strategy`.
    pub fn from_config(config: &ChunkingConfig) -> Result<Self, UnknownStrategy> {
        Ok(Self::new(config.strategy.parse()?, config.clone()))
    }

    pub fn kind(&self) -> ChunkStrategyKind {
        self.kind
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        chunk_with(self.kind, text, &self.config)
    }
}

/// Run one strategy and stamp reading positions on the result.
pub fn chunk_with(kind: ChunkStrategyKind, text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = match kind {
        ChunkStrategyKind::Sentence => to_chunks(sentence_pieces(text, config), ChunkType::Sentence),
        ChunkStrategyKind::Paragraph => {
            to_chunks(paragraph_pieces(text, config), ChunkType::Paragraph)
        }
        ChunkStrategyKind::Semantic => match semantic_chunks(text, config) {
            Some(chunks) => chunks,
            None => to_chunks(paragraph_pieces(text, config), ChunkType::Paragraph),
        },
        ChunkStrategyKind::Hybrid => hybrid_chunks(text, config),
        ChunkStrategyKind::Adaptive => adaptive_chunks(text, config),
    };

    if chunks.is_empty() {
        chunks.push(fallback_chunk(text, config));
    }
    for (i, chunk) in chunks.iter_mut().enumerate() {
        chunk.metadata.position = Some(i);
    }
    chunks
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn to_chunks(pieces: Vec<String>, chunk_type: ChunkType) -> Vec<Chunk> {
    pieces
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| Chunk::new(p, chunk_type))
        .collect()
}

fn fallback_chunk(text: &str, config: &ChunkingConfig) -> Chunk {
    let trimmed = text.trim();
    let source = if trimmed.is_empty() { text } else { trimmed };
    let truncated: String = source.chars().take(config.max_chunk_size).collect();
    Chunk::new(truncated, ChunkType::Fallback)
}

/// Greedily pack whitespace-delimited tokens into pieces of at most
/// `limit` characters. Tokens longer than `limit` are split by character.
fn pack_tokens(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for token in text.split_whitespace() {
        let token_len = char_len(token);

        if token_len > limit {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = token.chars().collect();
            for part in chars.chunks(limit) {
                pieces.push(part.iter().collect());
            }
            continue;
        }

        let would_be = if current.is_empty() {
            token_len
        } else {
            current_len + 1 + token_len
        };
        if would_be > limit && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(token);
        current_len += token_len;
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split on `.`, `!` or `?` followed by whitespace or end of text.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = match chars.peek() {
                None => true,
                Some(next) => next.is_whitespace(),
            };
            if at_boundary {
                let s = current.trim();
                if !s.is_empty() {
                    sentences.push(s.to_string());
                }
                current.clear();
            }
        }
    }
    let s = current.trim();
    if !s.is_empty() {
        sentences.push(s.to_string());
    }
    sentences
}

/// Pack sentences up to `target` characters, carrying up to `overlap`
/// characters of trailing sentences into the next piece.
fn pack_sentences(text: &str, target: usize, overlap: usize) -> Vec<String> {
    let target = target.max(1);
    let sentences: Vec<String> = split_sentences(text)
        .into_iter()
        .flat_map(|s| {
            if char_len(&s) > target {
                pack_tokens(&s, target)
            } else {
                vec![s]
            }
        })
        .collect();

    let mut pieces = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut len = 0usize;
    let mut fresh = 0usize;

    for sentence in sentences {
        let slen = char_len(&sentence);
        let would_be = if current.is_empty() { slen } else { len + 1 + slen };

        if would_be > target && fresh > 0 {
            pieces.push(current.join(" "));

            let mut carry: Vec<String> = Vec::new();
            let mut carry_len = 0usize;
            for prev in current.iter().rev() {
                let plen = char_len(prev);
                let next_len = if carry.is_empty() { plen } else { carry_len + 1 + plen };
                if next_len > overlap {
                    break;
                }
                carry.insert(0, prev.clone());
                carry_len = next_len;
            }
            if !carry.is_empty() && carry_len + 1 + slen > target {
                carry.clear();
                carry_len = 0;
            }
            current = carry;
            len = carry_len;
            fresh = 0;
        }

        len = if current.is_empty() { slen } else { len + 1 + slen };
        current.push(sentence);
        fresh += 1;
    }

    if fresh > 0 {
        pieces.push(current.join(" "));
    }
    pieces
}

fn sentence_pieces(text: &str, config: &ChunkingConfig) -> Vec<String> {
    pack_sentences(text, config.chunk_size, config.chunk_overlap)
}

fn paragraph_pieces(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let sep = config.separator.as_str();
    let sep_len = char_len(sep);
    let mut pieces = Vec::new();
    let mut buf = String::new();
    let mut buf_len = 0usize;

    for para in text.split(sep) {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let plen = char_len(trimmed);

        if plen > config.max_chunk_size {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
                buf_len = 0;
            }
            pieces.extend(pack_tokens(trimmed, config.chunk_size));
            continue;
        }

        let would_be = if buf.is_empty() { plen } else { buf_len + sep_len + plen };
        if would_be > config.chunk_size && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
            buf_len = 0;
        }
        if !buf.is_empty() {
            buf.push_str(sep);
            buf_len += sep_len;
        }
        buf.push_str(trimmed);
        buf_len += plen;
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Header-looking line: markdown heading, numbered heading, ALL CAPS, or a
/// short line ending in a colon.
pub fn looks_like_header(line: &str) -> bool {
    let line = line.trim();
    let len = char_len(line);
    if line.is_empty() || len > 100 {
        return false;
    }
    if line.starts_with('#') {
        return true;
    }

    let digits: String = line.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    if !digits.is_empty() && digits.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        let rest = &line[digits.len()..];
        let rest = rest.strip_prefix(')').unwrap_or(rest);
        if rest.starts_with(' ') && len <= 80 && !line.ends_with('.') {
            return true;
        }
    }

    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() >= 3 && len <= 80 && letters.iter().all(|c| c.is_uppercase()) {
        return true;
    }

    len <= 80 && line.ends_with(':') && !line.contains(". ")
}

/// `None` when the text contains no header-looking lines.
fn semantic_chunks(text: &str, config: &ChunkingConfig) -> Option<Vec<Chunk>> {
    let mut sections: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut headers = 0usize;

    for line in text.lines() {
        if looks_like_header(line) {
            headers += 1;
            if !current.trim().is_empty() {
                sections.push(std::mem::take(&mut current));
            }
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }

    if headers == 0 {
        return None;
    }

    let mut chunks = Vec::new();
    for section in sections {
        let trimmed = section.trim();
        if char_len(trimmed) > config.max_chunk_size {
            chunks.extend(to_chunks(paragraph_pieces(trimmed, config), ChunkType::Paragraph));
        } else {
            chunks.push(Chunk::new(trimmed, ChunkType::Semantic));
        }
    }
    Some(chunks)
}

fn hybrid_chunks(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    if let Some(chunks) = semantic_chunks(text, config).filter(|c| !c.is_empty()) {
        return chunks;
    }
    let paragraphs = to_chunks(paragraph_pieces(text, config), ChunkType::Paragraph);
    if !paragraphs.is_empty() {
        return paragraphs;
    }
    to_chunks(sentence_pieces(text, config), ChunkType::Sentence)
}

/// Complexity in `[0, 1]` from sentence length, word length, and the share
/// of acronyms and numbers.
pub fn complexity_score(text: &str) -> f64 {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let sentences = split_sentences(text).len().max(1);

    let words_per_sentence = words.len() as f64 / sentences as f64;
    let sentence_factor = (words_per_sentence / 40.0).clamp(0.0, 1.0);

    let avg_word_len =
        words.iter().map(|w| char_len(w)).sum::<usize>() as f64 / words.len() as f64;
    let word_factor = ((avg_word_len - 3.0) / 7.0).clamp(0.0, 1.0);

    let technical = words
        .iter()
        .filter(|w| {
            let letters: Vec<char> = w.chars().filter(|c| c.is_alphabetic()).collect();
            let acronym = letters.len() >= 2 && letters.iter().all(|c| c.is_uppercase());
            acronym || w.chars().any(|c| c.is_ascii_digit())
        })
        .count();
    let technical_factor = (technical as f64 / words.len() as f64 * 4.0).clamp(0.0, 1.0);

    (sentence_factor + word_factor + technical_factor) / 3.0
}

/// Target chunk size for text of the given complexity.
pub fn adaptive_target(complexity: f64, config: &ChunkingConfig) -> usize {
    let factor = if complexity > 0.6 {
        0.6
    } else if complexity > 0.3 {
        0.8
    } else {
        1.2
    };
    let target = (config.chunk_size as f64 * factor).round() as usize;
    target.clamp(config.min_chunk_size.max(1), config.max_chunk_size.max(1))
}

fn adaptive_chunks(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for para in text.split(config.separator.as_str()) {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let score = complexity_score(trimmed);
        let target = adaptive_target(score, config);
        for piece in pack_sentences(trimmed, target, 0) {
            chunks.push(Chunk::new(piece, ChunkType::Adaptive).with_complexity(score));
        }
    }
    merge_small(chunks, config)
}

/// Merge chunks shorter than `min_chunk_size` into their successor while
/// the result stays within `max_chunk_size`.
fn merge_small(chunks: Vec<Chunk>, config: &ChunkingConfig) -> Vec<Chunk> {
    let mut merged: Vec<Chunk> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if let Some(last) = merged.last_mut() {
            let combined = last.metadata.size + 1 + chunk.metadata.size;
            if last.metadata.size < config.min_chunk_size && combined <= config.max_chunk_size {
                let text = format!("{} {}", last.text, chunk.text);
                let complexity = match (last.metadata.complexity, chunk.metadata.complexity) {
                    (Some(a), Some(b)) => Some((a + b) / 2.0),
                    (a, b) => a.or(b),
                };
                let mut joined = Chunk::new(text, ChunkType::Adaptive);
                joined.metadata.complexity = complexity;
                *last = joined;
                continue;
            }
        }
        merged.push(chunk);
    }
    merged
}
