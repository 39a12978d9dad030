use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::cli::TokenizerMode;

/// Characters assumed per token when no BPE vocabulary is available.
pub const CHARS_PER_TOKEN: usize = 4;

/// Size accounting for chunk construction. Every size measured during one
/// run goes through the same implementation, so overlap and max-size checks
/// stay consistent with each other in degraded mode too.
pub trait Tokenizer: Send {
    fn name(&self) -> &'static str;
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
    fn count(&self, text: &str) -> usize;
    /// The last `n` tokens of `text`, as text.
    fn tail(&self, text: &str, n: usize) -> String;
    /// Sliding windows of at most `window` tokens, each starting `overlap`
    /// tokens before the end of the previous one.
    fn split_with_overlap(&self, text: &str, window: usize, overlap: usize) -> Vec<String>;
}

static FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

pub fn build_tokenizer(mode: TokenizerMode) -> Box<dyn Tokenizer> {
    match mode {
        TokenizerMode::CharApprox => Box::new(CharApproxTokenizer),
        TokenizerMode::Cl100kBase => match BpeTokenizer::cl100k_base() {
            Ok(tokenizer) => Box::new(tokenizer),
            Err(err) => {
                if !FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
                    warn!(
                        error = %err,
                        "failed to load cl100k_base tokenizer, using character approximation"
                    );
                }
                Box::new(CharApproxTokenizer)
            }
        },
    }
}

pub struct BpeTokenizer {
    bpe: CoreBPE,
}

impl BpeTokenizer {
    pub fn cl100k_base() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().context("failed to load cl100k_base encoding")?;
        Ok(Self { bpe })
    }

    // A window boundary can fall inside a multi-byte character; dropping up to
    // three tokens from either edge always reaches a valid UTF-8 boundary.
    fn decode_lossy(&self, tokens: &[u32]) -> String {
        let max_trim = tokens.len().min(3);
        for trim_front in 0..=max_trim {
            for trim_back in 0..=max_trim.saturating_sub(trim_front) {
                let slice = &tokens[trim_front..tokens.len() - trim_back];
                if let Ok(text) = self.bpe.decode(slice.to_vec()) {
                    return text;
                }
            }
        }
        String::new()
    }
}

impl Tokenizer for BpeTokenizer {
    fn name(&self) -> &'static str {
        "cl100k-base"
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        self.decode_lossy(tokens)
    }

    fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    fn tail(&self, text: &str, n: usize) -> String {
        if text.is_empty() || n == 0 {
            return String::new();
        }

        let tokens = self.encode(text);
        if tokens.len() <= n {
            return text.to_string();
        }
        self.decode(&tokens[tokens.len() - n..])
    }

    fn split_with_overlap(&self, text: &str, window: usize, overlap: usize) -> Vec<String> {
        let tokens = self.encode(text);
        if window == 0 || tokens.len() <= window {
            return non_empty(vec![text.trim().to_string()]);
        }

        let stride = window.saturating_sub(overlap).max(1);
        let mut pieces = Vec::<String>::new();
        let mut start = 0usize;

        loop {
            let end = (start + window).min(tokens.len());
            pieces.push(self.decode(&tokens[start..end]).trim().to_string());
            if end >= tokens.len() {
                break;
            }
            start += stride;
        }

        non_empty(pieces)
    }
}

/// Degraded mode: one token is taken to be four characters.
pub struct CharApproxTokenizer;

impl Tokenizer for CharApproxTokenizer {
    fn name(&self) -> &'static str {
        "char-approx"
    }

    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .filter_map(|value| char::from_u32(*value))
            .collect()
    }

    fn count(&self, text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }

    fn tail(&self, text: &str, n: usize) -> String {
        if text.is_empty() || n == 0 {
            return String::new();
        }

        let overlap_chars = n * CHARS_PER_TOKEN;
        let char_count = text.chars().count();
        if char_count <= overlap_chars {
            return text.to_string();
        }
        text.chars().skip(char_count - overlap_chars).collect()
    }

    fn split_with_overlap(&self, text: &str, window: usize, overlap: usize) -> Vec<String> {
        let chars = text.chars().collect::<Vec<char>>();
        let window_chars = window * CHARS_PER_TOKEN;
        if window_chars == 0 || chars.len() <= window_chars {
            return non_empty(vec![text.trim().to_string()]);
        }

        let overlap_chars = overlap * CHARS_PER_TOKEN;
        let mut pieces = Vec::<String>::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + window_chars).min(chars.len());
            if end < chars.len() {
                if let Some(cut) = last_sentence_break(&chars[start..end]) {
                    end = start + cut;
                }
            }

            pieces.push(chars[start..end].iter().collect::<String>().trim().to_string());
            if end >= chars.len() {
                break;
            }
            start = end.saturating_sub(overlap_chars).max(start + 1);
        }

        non_empty(pieces)
    }
}

/// Position just after the last ". " in the back half of `window`.
fn last_sentence_break(window: &[char]) -> Option<usize> {
    let half = window.len() / 2;
    (half + 1..window.len().saturating_sub(1))
        .rev()
        .find(|&index| window[index] == '.' && window[index + 1] == ' ')
        .map(|index| index + 1)
}

fn non_empty(pieces: Vec<String>) -> Vec<String> {
    pieces.into_iter().filter(|piece| !piece.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_approx_counts_four_characters_per_token() {
        let tokenizer = CharApproxTokenizer;
        assert_eq!(tokenizer.count(""), 0);
        assert_eq!(tokenizer.count("abc"), 0);
        assert_eq!(tokenizer.count("abcdefgh"), 2);
        assert_eq!(tokenizer.count("straße ab"), 2);
    }

    #[test]
    fn char_approx_tail_takes_last_characters() {
        let tokenizer = CharApproxTokenizer;
        assert_eq!(tokenizer.tail("0123456789", 2), "23456789");
        assert_eq!(tokenizer.tail("short", 10), "short");
        assert_eq!(tokenizer.tail("anything", 0), "");
    }

    #[test]
    fn char_approx_encode_decode_preserves_text() {
        let tokenizer = CharApproxTokenizer;
        let text = "Höhe über 4 m";
        assert_eq!(tokenizer.decode(&tokenizer.encode(text)), text);
    }

    #[test]
    fn char_approx_split_prefers_sentence_breaks_in_back_half() {
        let tokenizer = CharApproxTokenizer;
        // window = 10 tokens = 40 chars; the ". " at index 29 lies in the back half
        let text = format!("{}. {}", "a".repeat(29), "b".repeat(60));
        let pieces = tokenizer.split_with_overlap(&text, 10, 2);

        assert_eq!(pieces[0], format!("{}.", "a".repeat(29)));
        assert!(pieces.len() >= 3);
        assert!(pieces.iter().all(|piece| piece.chars().count() <= 40));
    }

    #[test]
    fn char_approx_split_ignores_sentence_breaks_in_front_half() {
        let tokenizer = CharApproxTokenizer;
        let text = format!("{}. {}", "a".repeat(5), "b".repeat(80));
        let pieces = tokenizer.split_with_overlap(&text, 10, 2);

        assert_eq!(pieces[0].chars().count(), 40);
    }

    #[test]
    fn char_approx_split_covers_every_character_with_overlap() {
        let tokenizer = CharApproxTokenizer;
        let text = (0..300)
            .map(|index| char::from(b'a' + (index % 26) as u8))
            .collect::<String>();
        let pieces = tokenizer.split_with_overlap(&text, 25, 5);

        // 100-char windows with a 20-char overlap advance 80 chars at a time
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0], text[0..100]);
        assert_eq!(pieces[1], text[80..180]);
        assert_eq!(pieces[2], text[160..260]);
        assert_eq!(pieces[3], text[240..300]);
    }

    #[test]
    fn bpe_counts_and_tails_tokens() {
        let tokenizer = BpeTokenizer::cl100k_base().expect("cl100k_base loads");
        assert_eq!(tokenizer.count("hello world"), 2);
        assert_eq!(tokenizer.tail("hello world", 1).trim(), "world");
        assert_eq!(tokenizer.tail("hello world", 5), "hello world");
    }

    #[test]
    fn bpe_split_windows_respect_window_size_and_overlap() {
        let tokenizer = BpeTokenizer::cl100k_base().expect("cl100k_base loads");
        let text = (0..400)
            .map(|index| format!("word{index}"))
            .collect::<Vec<_>>()
            .join(" ");
        let pieces = tokenizer.split_with_overlap(&text, 100, 20);

        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(tokenizer.count(piece) <= 102);
        }
        assert!(pieces.last().expect("pieces").ends_with("word399"));
        assert!(pieces[0].starts_with("word0 "));
    }

    #[test]
    fn build_tokenizer_honours_requested_mode() {
        assert_eq!(build_tokenizer(TokenizerMode::CharApprox).name(), "char-approx");
        assert_eq!(build_tokenizer(TokenizerMode::Cl100kBase).name(), "cl100k-base");
    }
}
