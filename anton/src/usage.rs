//! Token usage tracking for agent sessions.
//!
//! Every session reports cumulative prompt and completion tokens; the run
//! controller sums them across attempts to enforce the run-level token
//! budget.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Token usage reported by an agent session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by prompts sent to the model.
    #[serde(default)]
    pub prompt_tokens: u64,

    /// Tokens produced by the model.
    #[serde(default)]
    pub completion_tokens: u64,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// An empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    /// Total tokens consumed (prompt + completion).
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Whether any tokens have been recorded.
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_accumulates() {
        let mut total = Usage::zero();
        total += Usage::new(100, 40);
        total += Usage::new(50, 10);
        assert_eq!(total, Usage::new(150, 50));
        assert_eq!(total.total(), 200);
    }

    #[test]
    fn zero_is_zero() {
        assert!(Usage::zero().is_zero());
        assert!(!Usage::new(1, 0).is_zero());
    }
}
