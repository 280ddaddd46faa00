//! Token counting for budget-bounded context assembly
//!
//! The engine does not implement a tokenizer; it consumes one through the
//! `TokenCounter` trait. The default heuristic (chars/4) matches what the
//! rest of the system uses for fast budget estimates.

/// Deterministic token counter consumed by context assembly.
pub trait TokenCounter: Send + Sync {
    /// Count tokens in a piece of text. Must be deterministic for a
    /// given input.
    fn count(&self, text: &str) -> usize;
}

/// Fast chars/4 approximation suitable for budget management.
/// For precise tokenization, plug in a real tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl TokenCounter for HeuristicTokenizer {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_counts_quarter_of_chars() {
        let tokenizer = HeuristicTokenizer;
        assert_eq!(tokenizer.count(""), 0);
        assert_eq!(tokenizer.count("abcd"), 1);
        assert_eq!(tokenizer.count("abcde"), 2);
        assert_eq!(tokenizer.count(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_heuristic_is_deterministic() {
        let tokenizer = HeuristicTokenizer;
        let text = "the same text every time";
        assert_eq!(tokenizer.count(text), tokenizer.count(text));
    }
}
