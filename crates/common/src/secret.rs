//! Secret wrapper for sensitive values

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short prefix/suffix preview for log lines, see [`mask`].
    pub fn masked(&self) -> String {
        mask(&self.0)
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Number of leading characters kept visible by [`mask`].
const MASK_PREFIX: usize = 12;
/// Number of trailing characters kept visible by [`mask`].
const MASK_SUFFIX: usize = 6;
/// Values at or below this length are hidden entirely.
const MASK_MIN_LEN: usize = 16;

/// Mask a credential for logging: keep a short prefix and suffix, hide the middle.
///
/// Values of 16 characters or fewer are fully hidden as `***`, since a
/// 12+6 preview would reveal most of them.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= MASK_MIN_LEN {
        return "***".to_string();
    }
    let head: String = chars[..MASK_PREFIX].iter().collect();
    let tail: String = chars[chars.len() - MASK_SUFFIX..].iter().collect();
    format!("{head}...{tail}")
}
