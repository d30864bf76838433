//! Sentence-packing chunker.
//!
//! Documents are split on the literal `". "` delimiter and the resulting
//! sentences are packed greedily into chunks of at most `max_len` characters.
//! A sentence longer than `max_len` becomes its own oversized chunk.

use crate::corpus::Document;
use crate::metadata::ChunkRecord;

/// Default upper bound on chunk length, in characters.
pub const DEFAULT_MAX_CHUNK_LEN: usize = 800;

const SENTENCE_DELIMITER: &str = ". ";

/// Splits `text` into chunks of at most `max_len` characters (best effort).
pub fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;

    for sentence in sentences(text) {
        let sentence_len = sentence.chars().count();
        if buffer_len > 0 && buffer_len + 1 + sentence_len > max_len {
            flush(&mut chunks, &mut buffer);
            buffer_len = 0;
        }
        if buffer_len > 0 {
            buffer.push(' ');
            buffer_len += 1;
        }
        buffer.push_str(&sentence);
        buffer_len += sentence_len;
    }
    flush(&mut chunks, &mut buffer);
    chunks
}

/// Chunks a document, tagging every chunk with the document title.
pub fn chunk_document(document: &Document, max_len: usize) -> Vec<ChunkRecord> {
    chunk_text(&document.text, max_len)
        .into_iter()
        .map(|text| ChunkRecord {
            title: document.title.clone(),
            text,
        })
        .collect()
}

// Every segment that was followed by the delimiter gets its period back.
fn sentences(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut segments = text.split(SENTENCE_DELIMITER).peekable();
    std::iter::from_fn(move || loop {
        let segment = segments.next()?;
        if segment.trim().is_empty() {
            continue;
        }
        let sentence = if segments.peek().is_some() {
            format!("{segment}.")
        } else {
            segment.to_string()
        };
        return Some(sentence);
    })
}

fn flush(chunks: &mut Vec<String>, buffer: &mut String) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    buffer.clear();
}
