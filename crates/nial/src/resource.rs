//! Heap sizing policy.
//!
//! The heap is sized in words. `-size N` on the command line gives an initial
//! size with growth allowed up to a fixed cap; `+size N` fixes the size. The
//! suffixes `K`, `M` and `G` scale by powers of 1024.

use serde::{Deserialize, Serialize};

/// Default initial heap size in words when no flag is given.
pub const DEFAULT_HEAP_WORDS: usize = 1 << 22;

/// Hard cap on heap growth in words.
pub const HEAP_CAP_WORDS: usize = 1 << 28;

/// Sizing policy consulted by the heap on every allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLimits {
    /// Initial size of the backing region in words.
    pub initial_words: usize,
    /// Whether the region may grow beyond `initial_words` (up to the cap).
    pub expandable: bool,
}

impl HeapLimits {
    /// Policy for `-size N`: start at `words`, expansion allowed to the cap.
    #[must_use]
    pub fn expandable(words: usize) -> Self {
        Self {
            initial_words: words,
            expandable: true,
        }
    }

    /// Policy for `+size N`: start at `words`, expansion disallowed.
    #[must_use]
    pub fn fixed(words: usize) -> Self {
        Self {
            initial_words: words,
            expandable: false,
        }
    }

    /// The largest heap this policy permits.
    #[must_use]
    pub fn cap_words(&self) -> usize {
        if self.expandable {
            HEAP_CAP_WORDS.max(self.initial_words)
        } else {
            self.initial_words
        }
    }
}

impl Default for HeapLimits {
    fn default() -> Self {
        Self::expandable(DEFAULT_HEAP_WORDS)
    }
}

/// Parses a size argument of the form `N`, `NK`, `NM` or `NG` into words.
///
/// Returns `None` for malformed input; suffix letters are case-insensitive.
#[must_use]
pub fn parse_size(arg: &str) -> Option<usize> {
    let arg = arg.trim();
    if arg.is_empty() {
        return None;
    }
    let (digits, scale) = match arg.chars().last()? {
        'k' | 'K' => (&arg[..arg.len() - 1], 1024usize),
        'm' | 'M' => (&arg[..arg.len() - 1], 1024 * 1024),
        'g' | 'G' => (&arg[..arg.len() - 1], 1024 * 1024 * 1024),
        _ => (arg, 1),
    };
    let n: usize = digits.parse().ok()?;
    n.checked_mul(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("16K"), Some(16 * 1024));
        assert_eq!(parse_size("2m"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("12Q"), None);
    }

    #[test]
    fn fixed_policy_never_grows() {
        let limits = HeapLimits::fixed(1000);
        assert_eq!(limits.cap_words(), 1000);
        let limits = HeapLimits::expandable(1000);
        assert!(limits.cap_words() > 1000);
    }
}
