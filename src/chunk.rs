//! Paragraph-aware windowed text chunker for the knowledge corpus.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters.
//! Splitting happens on paragraph boundaries (`\n\n`) where possible; when a
//! chunk is flushed, trailing paragraphs totalling at most `overlap`
//! characters are carried into the next chunk so context straddling a
//! boundary survives. Paragraphs longer than `chunk_size` are hard-split on
//! whitespace with an `overlap`-character stride back.
//!
//! Each chunk carries a SHA-256 hash of its text.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Split text into overlapping chunks. Returns contiguous indices from 0.
/// Empty or whitespace-only input yields no chunks.
pub fn chunk_text(document: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let overlap = overlap.min(chunk_size.saturating_sub(1));
    let mut pieces: Vec<String> = Vec::new();
    let mut window: Vec<&str> = Vec::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if char_len(trimmed) > chunk_size {
            if !window.is_empty() {
                pieces.push(window.join("\n\n"));
                window.clear();
            }
            pieces.extend(hard_split(trimmed, chunk_size, overlap));
            continue;
        }

        if !window.is_empty() && joined_len(&window) + 2 + char_len(trimmed) > chunk_size {
            pieces.push(window.join("\n\n"));
            // Keep the tail of the window as overlap for the next chunk.
            while !window.is_empty()
                && (joined_len(&window) > overlap
                    || joined_len(&window) + 2 + char_len(trimmed) > chunk_size)
            {
                window.remove(0);
            }
        }
        window.push(trimmed);
    }

    if !window.is_empty() {
        pieces.push(window.join("\n\n"));
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, text)| make_chunk(document, i, &text))
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn joined_len(parts: &[&str]) -> usize {
    let chars: usize = parts.iter().map(|p| char_len(p)).sum();
    chars + parts.len().saturating_sub(1) * 2
}

/// Split one oversized paragraph into windows of at most `size` characters,
/// preferring to break at whitespace.
fn hard_split(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            if let Some(ws) = chars[start..end].iter().rposition(|c| c.is_whitespace()) {
                if ws > overlap {
                    end = start + ws;
                }
            }
        }
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    out
}

fn make_chunk(document: &str, index: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        document: document.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("doc1", "", 500, 50).is_empty());
        assert!(chunk_text("doc1", "  \n\n  ", 500, 50).is_empty());
    }

    #[test]
    fn test_chunks_respect_size() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {} about derivatives.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 120, 40);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i, "Index mismatch at position {}", i);
            assert!(c.text.chars().count() <= 120, "chunk {} too long", i);
        }
    }

    #[test]
    fn test_adjacent_chunks_overlap() {
        let text = "alpha one.\n\nbeta two.\n\ngamma three.\n\ndelta four.";
        // Each paragraph is ~10 chars; size 25 fits two, overlap 12 carries one.
        let chunks = chunk_text("doc1", text, 25, 12);
        assert!(chunks.len() >= 2);
        let first_tail = chunks[0].text.split("\n\n").last().unwrap();
        assert!(chunks[1].text.starts_with(first_tail));
    }

    #[test]
    fn test_oversized_paragraph_is_hard_split() {
        let long = "word ".repeat(300);
        let chunks = chunk_text("doc1", &long, 100, 10);
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 100));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 12, 5);
        let c2 = chunk_text("doc1", text, 12, 5);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
        }
    }
}
