use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

const SIMPLE_CHARS_PER_TOKEN: usize = 4;
const ENHANCED_WORD_MULTIPLIER: f64 = 1.3;
const ENHANCED_SPECIAL_DIVISOR: usize = 10;

/// Up to four letters form one token, every other non-space char is its own token.
static APPROXIMATE_TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\p{L}{1,4}|\S").expect("token pattern is valid"));

/// Type of tokenizer to use for estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenizerKind {
    /// Simple character-based tokenizer (~4 chars per token)
    Simple,
    /// Enhanced tokenizer with word and special character analysis
    Enhanced,
    /// Letter-run approximation of BPE tokenizers (default)
    #[default]
    Approximate,
}

impl TokenizerKind {
    /// Creates a new tokenizer instance of this kind.
    #[must_use]
    pub fn create(self) -> Arc<dyn TokenEstimator> {
        match self {
            Self::Simple => Arc::new(SimpleTokenizer),
            Self::Enhanced => Arc::new(EnhancedTokenizer),
            Self::Approximate => Arc::new(ApproximateTokenizer),
        }
    }
}

/// Trait for estimating token counts in text.
///
/// Implementations must be thread-safe. The summarizer relies on estimates
/// being (nearly) monotonic under concatenation: `estimate(a + b)` should
/// not be much smaller than `estimate(a) + estimate(b)`.
pub trait TokenEstimator: Send + Sync {
    /// Estimates the number of tokens in the given text.
    fn estimate(&self, text: &str) -> usize;
}

/// Simple character-based tokenizer.
///
/// Uses a heuristic of approximately 4 characters per token,
/// which works reasonably well for source code.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SimpleTokenizer;

impl TokenEstimator for SimpleTokenizer {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count();
        char_count
            .saturating_add(SIMPLE_CHARS_PER_TOKEN - 1)
            .saturating_div(SIMPLE_CHARS_PER_TOKEN)
            .max(1)
    }
}

/// Enhanced tokenizer with multiple heuristics.
///
/// This tokenizer considers:
/// - Word count (weighted by 1.3)
/// - Character count (divided by 4)
/// - Special characters (penalty factor)
#[derive(Debug, Clone, Copy)]
pub(crate) struct EnhancedTokenizer;

impl TokenEstimator for EnhancedTokenizer {
    fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let words = count_words(text);
        let chars = text.chars().count();
        let special_chars = count_special_chars(text);

        let word_estimate = (words as f64 * ENHANCED_WORD_MULTIPLIER) as usize;
        let char_estimate = chars.saturating_div(SIMPLE_CHARS_PER_TOKEN);
        let special_penalty = special_chars.saturating_div(ENHANCED_SPECIAL_DIVISOR);

        let base_estimate = word_estimate
            .saturating_add(char_estimate)
            .saturating_div(2);

        base_estimate.saturating_add(special_penalty).max(1)
    }
}

/// Fast approximation of a byte-pair tokenizer.
///
/// Counts runs of up to four letters plus every remaining
/// non-whitespace character. Close enough to `o200k`-style vocabularies
/// for budgeting, and strictly additive over whitespace-separated input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApproximateTokenizer;

impl TokenEstimator for ApproximateTokenizer {
    fn estimate(&self, text: &str) -> usize {
        APPROXIMATE_TOKEN_PATTERN.find_iter(text).count()
    }
}

/// Counts words in text (whitespace-separated).
#[inline]
fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Counts special (non-alphanumeric) characters.
#[inline]
fn count_special_chars(text: &str) -> usize {
    text.chars()
        .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
        .count()
}
