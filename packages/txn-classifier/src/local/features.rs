//! TF-IDF featurization over unigrams and bigrams.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::TrainingError;

/// Sparse feature vector: (term index, weight), sorted by index.
pub type SparseVector = Vec<(usize, f32)>;

/// Lowercased alphanumeric tokens of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Unigrams followed by adjacent-token bigrams.
pub fn terms(text: &str) -> Vec<String> {
    let tokens = tokenize(text);
    let bigrams = tokens.windows(2).map(|pair| format!("{} {}", pair[0], pair[1]));
    let mut out: Vec<String> = tokens.iter().cloned().collect();
    out.extend(bigrams);
    out
}

/// Term to inverse-document-frequency map. Term order is the feature index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    idf: IndexMap<String, f32>,
}

impl Vocabulary {
    /// Build a vocabulary from training documents.
    ///
    /// Terms seen in fewer than `min_df` documents are dropped; when more
    /// than `max_features` remain, the most frequent are kept (ties broken
    /// alphabetically so the result is deterministic).
    pub fn fit<S: AsRef<str>>(
        docs: &[S],
        min_df: usize,
        max_features: usize,
    ) -> Result<Self, TrainingError> {
        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let unique: HashSet<String> = terms(doc.as_ref()).into_iter().collect();
            for term in unique {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        let mut kept: Vec<(String, usize)> =
            df.into_iter().filter(|(_, n)| *n >= min_df.max(1)).collect();
        kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        kept.truncate(max_features);
        if kept.is_empty() {
            return Err(TrainingError::EmptyVocabulary);
        }
        // Stable index order independent of frequency ranking.
        kept.sort_by(|a, b| a.0.cmp(&b.0));

        let n = docs.len() as f32;
        let idf = kept
            .into_iter()
            .map(|(term, df)| {
                let idf = ((1.0 + n) / (1.0 + df as f32)).ln() + 1.0;
                (term, idf)
            })
            .collect();
        Ok(Self { idf })
    }

    /// Rebuild from stored (term, idf) pairs.
    pub fn from_terms(terms: impl IntoIterator<Item = (String, f32)>) -> Self {
        Self {
            idf: terms.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.idf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idf.is_empty()
    }

    pub fn idf(&self, term: &str) -> Option<f32> {
        self.idf.get(term).copied()
    }

    pub fn index_of(&self, term: &str) -> Option<usize> {
        self.idf.get_index_of(term)
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, f32)> {
        self.idf.iter().map(|(t, idf)| (t.as_str(), *idf))
    }

    /// L2-normalized TF-IDF vector. Unknown terms are ignored.
    pub fn transform(&self, text: &str) -> SparseVector {
        let mut tf: HashMap<usize, f32> = HashMap::new();
        for term in terms(text) {
            if let Some(index) = self.idf.get_index_of(&term) {
                *tf.entry(index).or_insert(0.0) += 1.0;
            }
        }

        let mut vector: SparseVector = tf
            .into_iter()
            .map(|(index, count)| (index, count * self.idf[index]))
            .collect();
        vector.sort_by_key(|(index, _)| *index);

        let norm = vector.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (_, w) in vector.iter_mut() {
                *w /= norm;
            }
        }
        vector
    }
}
