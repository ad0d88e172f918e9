//! Valve KeyValues block patcher.
//!
//! Operates on the game's nested key/value text format (`items_game.txt` and
//! friends): brace-delimited blocks, quoted keys and values, `//` line
//! comments. Content entries are identified by a purely numeric key; the same
//! numeric key can legitimately appear under unrelated sibling sections, so
//! extraction accepts an optional owner tag for disambiguation.
//!
//! All public functions normalize their input first. Documents in the wild
//! are produced by many authoring tools and routinely contain UTF-8 BOMs,
//! curly quotes, zero-width characters, and non-breaking spaces; feeding any
//! of those to the brace scanner unnormalized desynchronizes quote tracking.
//! The byte-preservation guarantees below are therefore relative to the
//! normalized form of the document.

use std::collections::HashMap;
use std::ops::Range;

/// Parse errors for the block scanner.
///
/// Deeply malformed input (unbalanced quotes or braces) is a hard error, not
/// a best-effort guess.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KvError {
    #[error("Unterminated quoted string starting at byte {0}")]
    UnbalancedQuote(usize),

    #[error("Unbalanced braces: block opened at byte {0} never closes")]
    UnbalancedBrace(usize),

    #[error("Unexpected closing brace at byte {0}")]
    StrayClose(usize),
}

/// Normalize raw config text before any structural parsing.
///
/// - strips a leading byte-order mark
/// - canonicalizes CRLF and bare CR line endings to LF
/// - replaces "smart" double/single quote variants with ASCII `"` / `'`
/// - strips zero-width characters
/// - collapses non-breaking spaces to ordinary spaces
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            // Double-quote variants: left/right/low curly quotes, angle quotes
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' | '\u{ab}' | '\u{bb}' => {
                out.push('"');
            }
            // Apostrophe variants: left/right/low single curly quotes
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' => out.push('\''),
            // Zero-width space/joiners and stray interior BOMs
            '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' => {}
            // Non-breaking space variants
            '\u{a0}' | '\u{202f}' => out.push(' '),
            _ => out.push(c),
        }
    }

    out
}

/// A lexical token with its byte offset in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    /// Quoted or bare string; offset is the start of the token including the
    /// opening quote when present.
    Str { text: &'a str, start: usize },
    Open(usize),
    Close(usize),
}

/// Quote-aware tokenizer over normalized KeyValues text.
///
/// Braces inside quoted strings are plain characters; `\"` and `\\` escapes
/// are honored inside quotes; `//` starts a comment running to end of line.
struct Tokenizer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn next_token(&mut self) -> Result<Option<Token<'a>>, KvError> {
        loop {
            // Skip whitespace
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }

            if self.pos >= self.bytes.len() {
                return Ok(None);
            }

            // Line comments
            if self.bytes[self.pos] == b'/'
                && self.pos + 1 < self.bytes.len()
                && self.bytes[self.pos + 1] == b'/'
            {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }

            break;
        }

        let start = self.pos;
        match self.bytes[self.pos] {
            b'{' => {
                self.pos += 1;
                Ok(Some(Token::Open(start)))
            }
            b'}' => {
                self.pos += 1;
                Ok(Some(Token::Close(start)))
            }
            b'"' => {
                self.pos += 1;
                let body_start = self.pos;
                loop {
                    if self.pos >= self.bytes.len() {
                        return Err(KvError::UnbalancedQuote(start));
                    }
                    match self.bytes[self.pos] {
                        b'\\' if self.pos + 1 < self.bytes.len() => self.pos += 2,
                        b'"' => break,
                        _ => self.pos += 1,
                    }
                }
                let text = &self.text[body_start..self.pos];
                self.pos += 1; // closing quote
                Ok(Some(Token::Str { text, start }))
            }
            _ => {
                // Bare token: runs until whitespace, brace, or quote
                while self.pos < self.bytes.len() {
                    match self.bytes[self.pos] {
                        b'{' | b'}' | b'"' => break,
                        c if c.is_ascii_whitespace() => break,
                        _ => self.pos += 1,
                    }
                }
                Ok(Some(Token::Str {
                    text: &self.text[start..self.pos],
                    start,
                }))
            }
        }
    }
}

/// Byte span of a brace-delimited block, delimiters included.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    span: Range<usize>,
}

/// True when a key denotes a content entry rather than a section header.
pub fn is_numeric_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

/// Collect every block whose immediately preceding key equals `id`, at any
/// nesting depth, in document order.
fn collect_candidates(doc: &str, id: &str) -> Result<Vec<Candidate>, KvError> {
    let mut tok = Tokenizer::new(doc);
    let mut last_str: Option<&str> = None;
    // Open blocks being captured: (open offset, matches id)
    let mut stack: Vec<(usize, bool)> = Vec::new();
    let mut out = Vec::new();

    while let Some(token) = tok.next_token()? {
        match token {
            Token::Str { text, .. } => last_str = Some(text),
            Token::Open(at) => {
                let matches = last_str == Some(id);
                stack.push((at, matches));
                last_str = None;
            }
            Token::Close(at) => {
                let Some((open_at, matches)) = stack.pop() else {
                    return Err(KvError::StrayClose(at));
                };
                if matches {
                    out.push(Candidate {
                        span: open_at..at + 1,
                    });
                }
                last_str = None;
            }
        }
    }

    if let Some((open_at, _)) = stack.first() {
        return Err(KvError::UnbalancedBrace(*open_at));
    }

    // Close events fire innermost-first; callers expect document order.
    out.sort_by_key(|c| c.span.start);
    Ok(out)
}

/// True when the block body contains `tag` as a nested key or value token.
fn body_contains_tag(body: &str, tag: &str) -> Result<bool, KvError> {
    let mut tok = Tokenizer::new(body);
    while let Some(token) = tok.next_token()? {
        if let Token::Str { text, .. } = token {
            if text == tag {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Find the byte span of the block identified by `id`, optionally requiring
/// `owner_tag` to appear inside the block body.
///
/// The span covers the block's braces and everything between them; the key
/// itself is outside the span. Without a tag the first structurally-matching
/// block wins, so callers needing precision must supply the tag.
///
/// Input must already be normalized; use the higher-level [`extract_block`] /
/// [`replace_block`] helpers when working with raw text.
pub fn find_block_span(
    doc: &str,
    id: &str,
    owner_tag: Option<&str>,
) -> Result<Option<Range<usize>>, KvError> {
    let candidates = collect_candidates(doc, id)?;

    for candidate in candidates {
        match owner_tag {
            None => return Ok(Some(candidate.span)),
            Some(tag) => {
                let body = &doc[candidate.span.start + 1..candidate.span.end - 1];
                if body_contains_tag(body, tag)? {
                    return Ok(Some(candidate.span));
                }
            }
        }
    }

    Ok(None)
}

/// Extract the full text of the block identified by `(id, owner_tag)`, braces
/// included, from a raw (possibly unnormalized) document.
pub fn extract_block(
    raw: &str,
    id: &str,
    owner_tag: Option<&str>,
) -> Result<Option<String>, KvError> {
    let doc = normalize(raw);
    Ok(find_block_span(&doc, id, owner_tag)?.map(|span| doc[span].to_string()))
}

/// Replace the block identified by `(id, owner_tag)` with `replacement`.
///
/// Returns the new document and whether a replacement occurred. Every byte
/// outside the matched span is carried over unchanged from the normalized
/// input. When no block matches, the normalized document is returned as-is
/// with `applied == false`.
pub fn replace_block(
    raw: &str,
    id: &str,
    owner_tag: Option<&str>,
    replacement: &str,
) -> Result<(String, bool), KvError> {
    let doc = normalize(raw);

    match find_block_span(&doc, id, owner_tag)? {
        Some(span) => {
            let mut out = String::with_capacity(doc.len() + replacement.len());
            out.push_str(&doc[..span.start]);
            out.push_str(replacement);
            out.push_str(&doc[span.end..]);
            Ok((out, true))
        }
        None => Ok((doc, false)),
    }
}

/// Bulk-parse every top-level content entry into `identifier -> block text`.
///
/// Top-level entries with non-numeric keys are section headers, not content
/// entries, and are skipped (their nested contents are not descended into).
pub fn parse_blocks(raw: &str) -> Result<HashMap<String, String>, KvError> {
    let doc = normalize(raw);
    let mut tok = Tokenizer::new(&doc);
    let mut out = HashMap::new();
    let mut last_str: Option<&str> = None;
    // (open offset, Some(key) when capturing a numeric top-level entry)
    let mut stack: Vec<(usize, Option<String>)> = Vec::new();

    while let Some(token) = tok.next_token()? {
        match token {
            Token::Str { text, .. } => last_str = Some(text),
            Token::Open(at) => {
                let key = if stack.is_empty() {
                    last_str.filter(|k| is_numeric_key(k)).map(String::from)
                } else {
                    None
                };
                stack.push((at, key));
                last_str = None;
            }
            Token::Close(at) => {
                let Some((open_at, key)) = stack.pop() else {
                    return Err(KvError::StrayClose(at));
                };
                if let Some(key) = key {
                    out.insert(key, doc[open_at..at + 1].to_string());
                }
                last_str = None;
            }
        }
    }

    if let Some((open_at, _)) = stack.first() {
        return Err(KvError::UnbalancedBrace(*open_at));
    }

    Ok(out)
}
