//! Paragraph-boundary text chunker used by `ragline ingest`.
//!
//! Text is split on blank lines and packed greedily into chunks of at most
//! `max_chars` characters. A paragraph longer than the limit is cut at the
//! last newline or space before the limit.
//!
//! Chunk ids are `"{document_id}:{index}"`, so re-ingesting an unchanged file
//! yields the same ids and the index treats it as a no-op.

use sha2::{Digest, Sha256};

use crate::models::ChunkInput;

/// Chunk size used when a caller does not pick one.
pub const DEFAULT_CHUNK_CHARS: usize = 1500;

/// Split `text` into chunks no longer than `max_chars` bytes.
pub fn chunk_text(document_id: &str, text: &str, max_chars: usize) -> Vec<ChunkInput> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            split_long(para, max_chars, &mut pieces);
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| ChunkInput {
            document_id: document_id.to_string(),
            chunk_id: format!("{}:{}", document_id, i),
            text,
        })
        .collect()
}

fn split_long(para: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let mut limit = max_chars;
        while !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = rest[..limit]
            .rfind('\n')
            .or_else(|| rest[..limit].rfind(' '))
            .map(|pos| pos + 1)
            .filter(|&pos| pos > 0)
            .unwrap_or(limit.max(first_char_len(rest)));
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }
}

fn first_char_len(s: &str) -> usize {
    s.chars().next().map(char::len_utf8).unwrap_or(1)
}

/// Hex SHA-256 of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
