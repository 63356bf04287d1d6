use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Canonical form of an input text. Runs are keyed on the hash of this.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_matches('\n').to_string()
}

/// Lowercase hex SHA-256 of the normalized text.
pub fn run_id_for(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Group paragraphs into chunks of roughly `max_words` words.
///
/// A paragraph is never split, so a single oversized paragraph becomes a
/// chunk of its own.
pub fn chunk_text(text: &str, max_words: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut count = 0;

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let words = para.split_whitespace().count();
        if !current.is_empty() && count + words > max_words {
            chunks.push(current.join("\n\n"));
            current.clear();
            count = 0;
        }
        current.push(para);
        count += words;
    }
    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }
    chunks
}

pub fn read_input(path: &Path) -> Result<String> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ext != "txt" {
        bail!("Unsupported input format {:?}: only .txt files are read", path);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace_noise() {
        let raw = "Ava waited.  \r\n\r\n\r\n\r\nThe ship came.\r\n";
        assert_eq!(normalize_text(raw), "Ava waited.\n\nThe ship came.");
        assert_eq!(normalize_text(raw), normalize_text("Ava waited.\n\nThe ship came."));
    }

    #[test]
    fn test_run_id_is_stable_hex() {
        let id = run_id_for("hello");
        assert_eq!(id.len(), 64);
        assert_eq!(
            id,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(id, run_id_for("hello!"));
    }

    #[test]
    fn test_chunks_respect_paragraphs() {
        let text = "one two three\n\nfour five\n\nsix seven eight nine";
        let chunks = chunk_text(text, 5);
        assert_eq!(chunks, vec!["one two three\n\nfour five", "six seven eight nine"]);
    }

    #[test]
    fn test_oversized_first_paragraph_does_not_emit_empty_chunk() {
        let text = "a b c d e f g\n\nh";
        let chunks = chunk_text(text, 3);
        assert_eq!(chunks, vec!["a b c d e f g", "h"]);
        assert!(chunk_text("   \n\n  ", 10).is_empty());
    }

    #[test]
    fn test_read_input_rejects_other_formats() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let txt = dir.path().join("story.txt");
        std::fs::write(&txt, "Once.")?;
        assert_eq!(read_input(&txt)?, "Once.");
        assert!(read_input(&dir.path().join("story.pdf")).is_err());
        Ok(())
    }
}
