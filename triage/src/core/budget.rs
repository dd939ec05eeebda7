//! Turn and token budget accounting for an investigation.

/// Tracks turns and token spend against fixed ceilings.
#[derive(Debug, Clone)]
pub struct InvestigationBudget {
    max_turns: u32,
    max_total_tokens: u64,
    turns_used: u32,
    tokens_used: u64,
}

impl InvestigationBudget {
    pub fn new(max_turns: u32, max_total_tokens: u64) -> Self {
        Self {
            max_turns,
            max_total_tokens,
            turns_used: 0,
            tokens_used: 0,
        }
    }

    /// Record one engine call and its token cost.
    pub fn record_turn(&mut self, tokens: u64) {
        self.turns_used += 1;
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    pub fn turns_used(&self) -> u32 {
        self.turns_used
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn turns_exhausted(&self) -> bool {
        self.turns_used >= self.max_turns
    }

    /// True once spend is strictly over the ceiling.
    pub fn tokens_exhausted(&self) -> bool {
        self.tokens_used > self.max_total_tokens
    }

    pub fn can_start_turn(&self) -> bool {
        !self.turns_exhausted() && !self.tokens_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_budget_allows_a_turn() {
        let budget = InvestigationBudget::new(3, 1_000);
        assert!(budget.can_start_turn());
        assert_eq!(budget.turns_used(), 0);
    }

    #[test]
    fn turns_exhaust_at_max() {
        let mut budget = InvestigationBudget::new(2, 1_000);
        budget.record_turn(10);
        assert!(budget.can_start_turn());
        budget.record_turn(10);
        assert!(budget.turns_exhausted());
        assert!(!budget.can_start_turn());
    }

    #[test]
    fn tokens_exhaust_only_when_exceeded() {
        let mut budget = InvestigationBudget::new(10, 100);
        budget.record_turn(100);
        assert!(!budget.tokens_exhausted());
        budget.record_turn(1);
        assert!(budget.tokens_exhausted());
        assert_eq!(budget.tokens_used(), 101);
    }

    #[test]
    fn token_counter_saturates() {
        let mut budget = InvestigationBudget::new(10, u64::MAX);
        budget.record_turn(u64::MAX);
        budget.record_turn(5);
        assert_eq!(budget.tokens_used(), u64::MAX);
    }
}
