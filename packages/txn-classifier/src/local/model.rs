//! Linear model snapshots: inference and checksummed serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ClassifierError, Result};
use crate::local::features::{SparseVector, Vocabulary};
use crate::types::training::{ModelKey, TaskType};

/// A trained model for one user and task.
///
/// Binary tasks store a single weight row scored with a sigmoid (the row
/// scores `classes[1]`); multi-class tasks store one row per class scored
/// with a softmax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub key: ModelKey,
    pub version: i64,
    pub classes: Vec<String>,
    pub vocabulary: Vocabulary,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
    pub trained_at: DateTime<Utc>,
    pub training_example_count: usize,
}

/// Output of local inference.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: String,
    pub class_index: usize,
    /// Probability of the predicted class
    pub confidence: f32,
    /// Probability of the task's positive class (binary tasks only)
    pub positive_probability: Option<f32>,
    pub version: i64,
}

/// Persisted form of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub key: ModelKey,
    pub version: i64,
    pub trained_at: DateTime<Utc>,
    pub training_example_count: usize,
    /// Hex SHA-256 of `payload`
    pub checksum: String,
    /// JSON-encoded [`ModelSnapshot`]
    pub payload: String,
}

impl ModelSnapshot {
    pub fn is_binary(&self) -> bool {
        self.key.task == TaskType::TransactionDetection
    }

    fn rows(&self) -> usize {
        if self.is_binary() {
            1
        } else {
            self.classes.len()
        }
    }

    /// Check dimensions and finiteness.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.classes.len() < 2 {
            return Err("fewer than two classes".to_string());
        }
        if self.vocabulary.is_empty() {
            return Err("empty vocabulary".to_string());
        }
        let dim = self.vocabulary.len();
        if self.weights.len() != self.rows() * dim {
            return Err(format!(
                "weights length {} does not match {} x {}",
                self.weights.len(),
                self.rows(),
                dim
            ));
        }
        if self.bias.len() != self.rows() {
            return Err("bias length mismatch".to_string());
        }
        if self.weights.iter().chain(&self.bias).any(|w| !w.is_finite()) {
            return Err("non-finite weights".to_string());
        }
        Ok(())
    }

    /// Class probabilities for a feature vector, in class order.
    pub fn predict_proba(&self, features: &SparseVector) -> Vec<f32> {
        let dim = self.vocabulary.len();
        let logits: Vec<f32> = (0..self.rows())
            .map(|row| {
                let base = row * dim;
                features
                    .iter()
                    .filter(|(i, _)| *i < dim)
                    .fold(self.bias[row], |sum, (i, x)| sum + self.weights[base + i] * x)
            })
            .collect();

        if self.is_binary() {
            let p = sigmoid(logits[0]);
            vec![1.0 - p, p]
        } else {
            softmax(&logits)
        }
    }

    /// Vectorize and classify text.
    pub fn predict(&self, text: &str) -> Prediction {
        let features = self.vocabulary.transform(text);
        let proba = self.predict_proba(&features);
        let (class_index, confidence) = proba
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let positive_probability = self.key.task.positive_class().and_then(|positive| {
            self.classes
                .iter()
                .position(|c| c == positive)
                .map(|i| proba[i])
        });

        Prediction {
            class: self.classes[class_index].clone(),
            class_index,
            confidence,
            positive_probability,
            version: self.version,
        }
    }

    /// Encode with a checksum for storage.
    pub fn to_record(&self) -> Result<SnapshotRecord> {
        let payload = serde_json::to_string(self)?;
        Ok(SnapshotRecord {
            key: self.key.clone(),
            version: self.version,
            trained_at: self.trained_at,
            training_example_count: self.training_example_count,
            checksum: checksum(&payload),
            payload,
        })
    }

    /// Decode a stored record. Any integrity failure is `ModelCorruption`.
    pub fn from_record(record: &SnapshotRecord) -> Result<Self> {
        let corrupt = |reason: String| ClassifierError::ModelCorruption {
            key: record.key.clone(),
            version: record.version,
            reason,
        };

        if checksum(&record.payload) != record.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let snapshot: ModelSnapshot =
            serde_json::from_str(&record.payload).map_err(|e| corrupt(e.to_string()))?;
        if snapshot.key != record.key || snapshot.version != record.version {
            return Err(corrupt("record header does not match payload".to_string()));
        }
        snapshot.validate().map_err(corrupt)?;
        Ok(snapshot)
    }
}

fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![1.0 / logits.len() as f32; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_snapshot() -> ModelSnapshot {
        let vocabulary = Vocabulary::from_terms([("escrow".to_string(), 1.0), ("sale".to_string(), 1.0)]);
        ModelSnapshot {
            key: ModelKey::detection("u1"),
            version: 3,
            classes: TaskType::TransactionDetection.classes(),
            vocabulary,
            weights: vec![6.0, -6.0],
            bias: vec![0.0],
            trained_at: Utc::now(),
            training_example_count: 60,
        }
    }

    #[test]
    fn test_binary_prediction() {
        let model = binary_snapshot();
        let p = model.predict("escrow update");
        assert_eq!(p.class, "transaction");
        assert!(p.confidence > 0.99);
        assert_eq!(p.positive_probability, Some(p.confidence));
        assert_eq!(p.version, 3);

        let n = model.predict("big sale this weekend");
        assert_eq!(n.class, "not_transaction");
        assert!(n.positive_probability.unwrap() < 0.01);
    }

    #[test]
    fn test_record_roundtrip_and_tamper_detection() {
        let model = binary_snapshot();
        let record = model.to_record().unwrap();
        assert_eq!(ModelSnapshot::from_record(&record).unwrap(), model);

        let mut tampered = record.clone();
        tampered.payload = tampered.payload.replace("6.0", "7.0");
        let err = ModelSnapshot::from_record(&tampered).unwrap_err();
        assert!(matches!(err, ClassifierError::ModelCorruption { version: 3, .. }));
    }

    #[test]
    fn test_dimension_mismatch_is_corruption() {
        let mut model = binary_snapshot();
        model.weights.push(1.0);
        let record = model.to_record().unwrap();
        assert!(matches!(
            ModelSnapshot::from_record(&record),
            Err(ClassifierError::ModelCorruption { .. })
        ));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }
}
