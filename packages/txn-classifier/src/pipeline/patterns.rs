//! Deterministic signal scorer. No state, no network.
//!
//! Positive signals combine by noisy-OR (`1 - Π(1 - w)`); negative signals
//! (newsletter and marketing markers) are subtracted from the result.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::message::Message;
use crate::types::training::TransactionType;

/// Score at which the pattern engine votes "transaction".
pub const PATTERN_POSITIVE_FLOOR: f32 = 0.40;

/// Confidence cap for a negative pattern vote: absence of signals is weak
/// evidence.
pub const PATTERN_NEGATIVE_CAP: f32 = 0.60;

const KEYWORDS: &[(&str, f32, Option<TransactionType>)] = &[
    ("escrow", 0.50, None),
    ("earnest money", 0.55, Some(TransactionType::Purchase)),
    ("closing date", 0.50, None),
    ("closing disclosure", 0.55, None),
    ("purchase agreement", 0.60, Some(TransactionType::Purchase)),
    ("purchase and sale agreement", 0.60, Some(TransactionType::Purchase)),
    ("offer accepted", 0.55, Some(TransactionType::Purchase)),
    ("accepted offer", 0.55, Some(TransactionType::Purchase)),
    ("counteroffer", 0.45, Some(TransactionType::Purchase)),
    ("counter offer", 0.45, Some(TransactionType::Purchase)),
    ("under contract", 0.50, None),
    ("home inspection", 0.35, None),
    ("inspection report", 0.35, None),
    ("appraisal", 0.30, None),
    ("title company", 0.40, None),
    ("title insurance", 0.40, None),
    ("contingency", 0.35, None),
    ("pre-approval", 0.30, Some(TransactionType::Purchase)),
    ("preapproval", 0.30, Some(TransactionType::Purchase)),
    ("final walkthrough", 0.40, None),
    ("final walk-through", 0.40, None),
    ("wire instructions", 0.35, None),
    ("listing agreement", 0.50, Some(TransactionType::Sale)),
    ("list price", 0.25, Some(TransactionType::Sale)),
    ("seller disclosure", 0.45, Some(TransactionType::Sale)),
    ("lease agreement", 0.45, Some(TransactionType::Lease)),
    ("rental application", 0.35, Some(TransactionType::Lease)),
    ("security deposit", 0.30, Some(TransactionType::Lease)),
    ("refinance", 0.40, Some(TransactionType::Refinance)),
    ("rate lock", 0.40, Some(TransactionType::Refinance)),
    ("deed", 0.30, None),
];

const ROLE_TITLES: &[&str] = &[
    "listing agent",
    "buyer's agent",
    "buyers agent",
    "selling agent",
    "escrow officer",
    "loan officer",
    "transaction coordinator",
    "closing attorney",
    "real estate attorney",
    "realtor",
    "property manager",
];

/// Transaction-management and title/escrow services.
const TRANSACTION_DOMAINS: &[(&str, f32)] = &[
    ("dotloop.com", 0.40),
    ("skyslope.com", 0.40),
    ("docusign.net", 0.25),
    ("firstam.com", 0.40),
    ("stewart.com", 0.40),
    ("fnf.com", 0.40),
    ("qualia.com", 0.40),
    ("zillow.com", 0.15),
    ("redfin.com", 0.15),
];

const NEGATIVE_MARKERS: &[(&str, f32)] = &[
    ("unsubscribe", 0.25),
    ("newsletter", 0.20),
    ("view in browser", 0.15),
    ("view this email in your browser", 0.15),
    ("market update", 0.15),
    ("market report", 0.15),
    ("webinar", 0.15),
    ("sponsored", 0.10),
];

lazy_static! {
    static ref ADDRESS_REGEX: Regex = Regex::new(
        r"\b\d{1,6}\s+(?:[A-Z][a-z]+\s+){1,3}(?:St|Street|Ave|Avenue|Rd|Road|Dr|Drive|Ln|Lane|Ct|Court|Blvd|Boulevard|Way|Pl|Place|Ter|Terrace|Cir|Circle)\b"
    ).unwrap();

    static ref MLS_REGEX: Regex = Regex::new(r"(?i)\bMLS\s*(?:#|no\.?|number)?\s*:?\s*[A-Z]?\d{5,}\b").unwrap();

    static ref SUBJECT_VOCAB_REGEX: Regex =
        Regex::new(r"(?i)\b(?:offer|closing|escrow|under contract|contract|addendum)\b").unwrap();

    static ref PRICE_REGEX: Regex =
        Regex::new(r"\$\s?\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\$\s?\d+(?:\.\d+)?\s?[kKmM]\b").unwrap();

    static ref ATTACHMENT_REGEX: Regex = Regex::new(
        r"(?i)(?:purchase|sale|lease|listing)[\s_-]*(?:and[\s_-]*sale[\s_-]*)?(?:agreement|contract)|addendum|disclosure|closing|settlement|hud[\s_-]?1|inspection|appraisal|pre[\s_-]?approval"
    ).unwrap();
}

/// Output of the pattern engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternScore {
    /// Combined score in [0, 1]
    pub score: f32,
    pub matched_signals: Vec<String>,
    /// Most supported transaction type, when positive
    pub transaction_type: Option<TransactionType>,
}

impl PatternScore {
    pub fn is_transaction(&self) -> bool {
        self.score >= PATTERN_POSITIVE_FLOOR
    }

    /// Confidence in the pattern engine's own label.
    pub fn vote_confidence(&self) -> f32 {
        if self.is_transaction() {
            self.score
        } else {
            (1.0 - self.score).min(PATTERN_NEGATIVE_CAP)
        }
    }
}

/// Keyword, role, domain, subject, price and attachment scorer.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher;

impl PatternMatcher {
    pub fn new() -> Self {
        Self
    }

    pub fn score(&self, message: &Message) -> PatternScore {
        let subject = message.subject.as_str();
        let text = format!("{}\n{}", subject, message.body).to_lowercase();

        let mut signals = Vec::new();
        let mut positive: Vec<f32> = Vec::new();
        let mut type_votes: HashMap<TransactionType, f32> = HashMap::new();

        for (phrase, weight, hint) in KEYWORDS {
            if contains_phrase(&text, phrase) {
                signals.push(format!("keyword:{phrase}"));
                positive.push(*weight);
                if let Some(t) = hint {
                    *type_votes.entry(*t).or_insert(0.0) += *weight;
                }
            }
        }

        let roles: Vec<&str> = ROLE_TITLES
            .iter()
            .copied()
            .filter(|role| contains_phrase(&text, role))
            .collect();
        if !roles.is_empty() {
            // Multiple titles add little over the first.
            positive.push(0.25 + 0.05 * (roles.len() as f32 - 1.0).min(3.0));
            signals.extend(roles.iter().map(|r| format!("role:{r}")));
        }

        let domain = message.sender_domain.to_lowercase();
        if let Some((d, weight)) = TRANSACTION_DOMAINS
            .iter()
            .find(|(d, _)| domain == *d || domain.ends_with(&format!(".{d}")))
        {
            signals.push(format!("domain:{d}"));
            positive.push(*weight);
        }

        if ADDRESS_REGEX.is_match(subject) {
            signals.push("subject:address".to_string());
            positive.push(0.35);
        }
        if MLS_REGEX.is_match(subject) || MLS_REGEX.is_match(&message.body) {
            signals.push("mls_number".to_string());
            positive.push(0.40);
        }
        if SUBJECT_VOCAB_REGEX.is_match(subject) {
            signals.push("subject:deal_vocabulary".to_string());
            positive.push(0.30);
        }
        if PRICE_REGEX.is_match(subject) || PRICE_REGEX.is_match(&message.body) {
            signals.push("price".to_string());
            positive.push(0.20);
        }
        for attachment in &message.attachments {
            if ATTACHMENT_REGEX.is_match(&attachment.filename) {
                signals.push(format!("attachment:{}", attachment.filename));
                positive.push(0.35);
                break;
            }
        }

        let mut negative = 0.0f32;
        for (marker, weight) in NEGATIVE_MARKERS {
            if contains_phrase(&text, marker) {
                signals.push(format!("negative:{marker}"));
                negative += *weight;
            }
        }

        let combined = 1.0 - positive.iter().fold(1.0, |acc, w| acc * (1.0 - w));
        let score = (combined - negative).clamp(0.0, 1.0);

        let transaction_type = if score >= PATTERN_POSITIVE_FLOOR {
            type_votes
                .into_iter()
                .max_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then_with(|| b.0.as_str().cmp(a.0.as_str()))
                })
                .map(|(t, _)| t)
        } else {
            None
        };

        PatternScore {
            score,
            matched_signals: signals,
            transaction_type,
        }
    }
}

/// Substring match on word boundaries ("deed" does not match "indeed").
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
