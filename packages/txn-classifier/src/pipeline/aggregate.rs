//! Fuses engine votes into one decision, score and confidence level.

use serde::{Deserialize, Serialize};

use crate::types::result::ConfidenceLevel;

/// Weight of the authoritative engine when engines disagree.
pub const AUTHORITY_WEIGHT: f32 = 0.60;

/// Weight of the non-authoritative model engine.
pub const SECONDARY_WEIGHT: f32 = 0.25;

/// Weight of the pattern engine (when it is not the authority).
pub const PATTERN_WEIGHT: f32 = 0.15;

/// Boost per additional agreeing engine, as a share of the remaining gap.
pub const AGREEMENT_BOOST: f32 = 0.25;

/// Weighted p(transaction) at which a disagreement resolves positive.
pub const DISAGREEMENT_POSITIVE_FLOOR: f32 = 0.40;

/// One engine's label and its confidence in that label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineVote {
    pub is_transaction: bool,
    /// Always within [0.5, 1]
    pub confidence: f32,
}

impl EngineVote {
    /// A vote is never less confident than a coin flip in its own label.
    pub fn new(is_transaction: bool, confidence: f32) -> Self {
        let confidence = if confidence.is_finite() { confidence } else { 0.5 };
        Self {
            is_transaction,
            confidence: confidence.clamp(0.5, 1.0),
        }
    }

    /// Probability that the message is transaction-related.
    pub fn p_transaction(&self) -> f32 {
        if self.is_transaction {
            self.confidence
        } else {
            1.0 - self.confidence
        }
    }
}

/// Engine whose vote carries the authority weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Pattern,
    Llm,
    Local,
}

/// Votes handed to the aggregator. `None` means the engine does not take
/// part (not invoked, failed, or silent at this tier).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateInput {
    pub authority: Authority,
    pub pattern: EngineVote,
    pub llm: Option<EngineVote>,
    pub local: Option<EngineVote>,
}

/// Aggregated decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub is_transaction: bool,
    /// Confidence in `is_transaction`
    pub confidence: f32,
    pub level: ConfidenceLevel,
    /// Whether every participating engine voted the same label
    pub unanimous: bool,
    pub participants: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceAggregator;

impl ConfidenceAggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn aggregate(&self, input: &AggregateInput) -> Aggregate {
        let votes = weighted_votes(input);
        let participants = votes.len();
        let first = votes[0].0;
        let unanimous = votes.iter().all(|(v, _)| v.is_transaction == first.is_transaction);

        if unanimous {
            let max = votes
                .iter()
                .map(|(v, _)| v.confidence)
                .fold(0.0f32, f32::max);
            let boost = AGREEMENT_BOOST * (participants as f32 - 1.0);
            let confidence = (max + (1.0 - max) * boost).min(1.0);
            return Aggregate {
                is_transaction: first.is_transaction,
                confidence,
                level: ConfidenceLevel::from_score(confidence),
                unanimous,
                participants,
            };
        }

        let total: f32 = votes.iter().map(|(_, w)| w).sum();
        let p = votes.iter().map(|(v, w)| v.p_transaction() * w).sum::<f32>() / total;
        let is_transaction = p >= DISAGREEMENT_POSITIVE_FLOOR;
        let confidence = if is_transaction { p } else { 1.0 - p };
        Aggregate {
            is_transaction,
            confidence,
            level: ConfidenceLevel::from_score(confidence).demote(),
            unanimous,
            participants,
        }
    }
}

/// Participating votes with their (unnormalized) weights; pattern first.
fn weighted_votes(input: &AggregateInput) -> Vec<(EngineVote, f32)> {
    let weight = |engine: Authority| match (engine, input.authority) {
        (a, b) if a == b => AUTHORITY_WEIGHT,
        (Authority::Pattern, _) => PATTERN_WEIGHT,
        _ => SECONDARY_WEIGHT,
    };
    let mut votes = vec![(input.pattern, weight(Authority::Pattern))];
    if let Some(llm) = input.llm {
        votes.push((llm, weight(Authority::Llm)));
    }
    if let Some(local) = input.local {
        votes.push((local, weight(Authority::Local)));
    }
    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn input(pattern: EngineVote, llm: Option<EngineVote>, local: Option<EngineVote>) -> AggregateInput {
        AggregateInput {
            authority: Authority::Llm,
            pattern,
            llm,
            local,
        }
    }

    #[test]
    fn test_agreement_boosts_max() {
        let agg = ConfidenceAggregator::new().aggregate(&input(
            EngineVote::new(true, 0.6),
            Some(EngineVote::new(true, 0.9)),
            None,
        ));
        assert!(agg.is_transaction);
        assert!(agg.unanimous);
        assert!((agg.confidence - 0.925).abs() < 1e-6);
        assert_eq!(agg.level, ConfidenceLevel::High);
    }

    #[test]
    fn test_agreement_capped_at_one() {
        let agg = ConfidenceAggregator::new().aggregate(&input(
            EngineVote::new(false, 0.6),
            Some(EngineVote::new(false, 1.0)),
            Some(EngineVote::new(false, 0.99)),
        ));
        assert!(!agg.is_transaction);
        assert_eq!(agg.confidence, 1.0);
    }

    #[test]
    fn test_single_engine_keeps_its_confidence() {
        let agg = ConfidenceAggregator::new().aggregate(&AggregateInput {
            authority: Authority::Pattern,
            pattern: EngineVote::new(true, 0.72),
            llm: None,
            local: None,
        });
        assert_eq!(agg.participants, 1);
        assert!((agg.confidence - 0.72).abs() < 1e-6);
        assert_eq!(agg.level, ConfidenceLevel::Medium);
    }

    #[test]
    fn test_disagreement_is_recall_biased() {
        // LLM says no at 0.55, pattern says yes at 0.9:
        // p = (0.6 * 0.45 + 0.15 * 0.9) / 0.75 = 0.54
        let agg = ConfidenceAggregator::new().aggregate(&input(
            EngineVote::new(true, 0.9),
            Some(EngineVote::new(false, 0.55)),
            None,
        ));
        assert!(!agg.unanimous);
        assert!(agg.is_transaction);
        assert!((agg.confidence - 0.54).abs() < 1e-5);
        assert_eq!(agg.level, ConfidenceLevel::Low);
    }

    #[test]
    fn test_disagreement_demotes_level() {
        // p = (0.6 * 0.02 + 0.25 * 0.05 + 0.15 * 0.6) / 1.0 = 0.1145
        let agg = ConfidenceAggregator::new().aggregate(&input(
            EngineVote::new(true, 0.6),
            Some(EngineVote::new(false, 0.98)),
            Some(EngineVote::new(false, 0.95)),
        ));
        assert!(!agg.is_transaction);
        assert!((agg.confidence - 0.8855).abs() < 1e-5);
        assert_eq!(agg.level, ConfidenceLevel::Medium);
    }

    #[test]
    fn test_local_authority_weighting() {
        let agg = ConfidenceAggregator::new().aggregate(&AggregateInput {
            authority: Authority::Local,
            pattern: EngineVote::new(false, 0.6),
            llm: None,
            local: Some(EngineVote::new(true, 0.9)),
        });
        // p = (0.15 * 0.4 + 0.6 * 0.9) / 0.75 = 0.8
        assert!(agg.is_transaction);
        assert!((agg.confidence - 0.8).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn agreement_never_below_disagreement(
            pattern in 0.5f32..=1.0,
            llm in 0.5f32..=1.0,
            local in proptest::option::of(0.5f32..=1.0),
            flip_llm in any::<bool>(),
        ) {
            let aggregator = ConfidenceAggregator::new();
            let agree = aggregator.aggregate(&input(
                EngineVote::new(true, pattern),
                Some(EngineVote::new(true, llm)),
                local.map(|c| EngineVote::new(true, c)),
            ));
            let disagree = aggregator.aggregate(&input(
                EngineVote::new(!flip_llm, pattern),
                Some(EngineVote::new(flip_llm, llm)),
                local.map(|c| EngineVote::new(true, c)),
            ));
            prop_assert!(agree.level >= disagree.level);
            prop_assert!((0.0..=1.0).contains(&agree.confidence));
            prop_assert!((0.0..=1.0).contains(&disagree.confidence));
        }
    }
}
