use foreman_core::TokenUsage;

/// Tracks token spend against an optional request-level budget.
pub struct TokenBudget {
    limit: Option<u64>,
    spent: u64,
}

impl TokenBudget {
    /// Start from usage already accumulated on the run.
    pub fn new(limit: Option<u64>, already_spent: TokenUsage) -> Self {
        Self {
            limit,
            spent: already_spent.total(),
        }
    }

    pub fn record(&mut self, usage: TokenUsage) {
        self.spent = self.spent.saturating_add(usage.total());
    }

    pub fn spent(&self) -> u64 {
        self.spent
    }

    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|b| b.saturating_sub(self.spent))
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit.map(|b| self.spent >= b).unwrap_or(false)
    }
}
