//! Context-window budget estimates for rendered instructions.

/// Rough characters-per-token ratio used for the pre-dispatch fit check.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Fit check outcome; overflow is advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextFit {
    pub estimated_tokens: usize,
    pub window_tokens: usize,
}

impl ContextFit {
    pub fn check(text: &str, window_tokens: usize) -> Self {
        Self {
            estimated_tokens: estimate_tokens(text),
            window_tokens,
        }
    }

    pub fn fits(&self) -> bool {
        self.estimated_tokens <= self.window_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn fit_check_compares_against_window() {
        assert!(ContextFit::check(&"x".repeat(40), 10).fits());
        assert!(!ContextFit::check(&"x".repeat(41), 10).fits());
    }
}
