use std::collections::HashMap;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, Rng, SeedableRng};

use super::features::{SparseVector, Vocabulary};
use super::model::{sigmoid, softmax, ModelSnapshot};
use crate::error::TrainingError;
use crate::types::config::TrainingParams;
use crate::types::training::{LabelSource, ModelKey, TrainingExample};

/// Deduplicated, weighted training rows.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub texts: Vec<String>,
    pub labels: Vec<usize>,
    pub weights: Vec<f32>,
}

impl TrainingSet {
    /// Build from raw examples.
    ///
    /// One row per `features_ref`: a user label always wins over an LLM
    /// label for the same text, and among labels of the same source the most
    /// recent wins. Labels outside `classes` are ignored.
    pub fn from_examples(
        examples: &[TrainingExample],
        classes: &[String],
        llm_weight: f32,
    ) -> Self {
        let mut chosen: HashMap<&str, &TrainingExample> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for example in examples {
            if !classes.contains(&example.label) {
                continue;
            }
            match chosen.get(example.features_ref.as_str()) {
                None => {
                    order.push(&example.features_ref);
                    chosen.insert(&example.features_ref, example);
                }
                Some(existing) => {
                    let replaces = match (existing.label_source, example.label_source) {
                        (LabelSource::User, LabelSource::Llm) => false,
                        (LabelSource::Llm, LabelSource::User) => true,
                        _ => example.created_at >= existing.created_at,
                    };
                    if replaces {
                        chosen.insert(&example.features_ref, example);
                    }
                }
            }
        }

        let mut set = TrainingSet::default();
        for features_ref in order {
            let example = chosen[features_ref];
            let Some(label) = classes.iter().position(|c| *c == example.label) else {
                continue;
            };
            set.texts.push(example.text.clone());
            set.labels.push(label);
            set.weights.push(match example.label_source {
                LabelSource::User => 1.0,
                LabelSource::Llm => llm_weight,
            });
        }
        set
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }
}

/// Fit a fresh model from the full training set.
pub fn train_model(
    key: &ModelKey,
    version: i64,
    set: &TrainingSet,
    params: &TrainingParams,
) -> Result<ModelSnapshot, TrainingError> {
    let classes = key.task.classes();
    if set.len() < params.min_examples.max(1) {
        return Err(TrainingError::InsufficientExamples {
            have: set.len(),
            need: params.min_examples.max(1),
        });
    }

    let mut counts = vec![0f32; classes.len()];
    for &y in &set.labels {
        counts[y] += 1.0;
    }
    if counts.iter().filter(|c| **c > 0.0).count() < 2 {
        let class = counts
            .iter()
            .position(|c| *c > 0.0)
            .map(|i| classes[i].clone())
            .unwrap_or_default();
        return Err(TrainingError::SingleClass { class });
    }

    let vocabulary = Vocabulary::fit(
        &set.texts,
        params.min_document_frequency,
        params.max_features,
    )?;
    let x: Vec<SparseVector> = set.texts.iter().map(|t| vocabulary.transform(t)).collect();

    let binary = key.task.positive_class().is_some();
    let rows = if binary { 1 } else { classes.len() };
    let dim = vocabulary.len();

    let class_weights: Vec<f32> = if params.balance_classes {
        let total: f32 = counts.iter().sum();
        counts
            .iter()
            .map(|&count| {
                if count == 0.0 {
                    0.0
                } else {
                    total / (classes.len() as f32 * count)
                }
            })
            .collect()
    } else {
        vec![1.0; classes.len()]
    };

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut weights: Vec<f32> = (0..rows * dim)
        .map(|_| (rng.gen::<f32>() - 0.5) * 0.01)
        .collect();
    let mut bias = vec![0.0f32; rows];

    let mut indices: Vec<usize> = (0..set.len()).collect();
    let batch_size = params.batch_size.max(1);
    let lr = params.learning_rate;
    let l2 = params.l2.max(0.0);

    for _epoch in 0..params.epochs {
        indices.shuffle(&mut rng);
        for chunk in indices.chunks(batch_size) {
            let mut grad_w: HashMap<usize, f32> = HashMap::new();
            let mut grad_b = vec![0.0f32; rows];
            let mut batch_weight = 0.0f32;

            for &idx in chunk {
                let y = set.labels[idx];
                let weight = class_weights[y] * set.weights[idx];
                if weight == 0.0 {
                    continue;
                }
                let features = &x[idx];
                let logits: Vec<f32> = (0..rows)
                    .map(|row| {
                        let base = row * dim;
                        features
                            .iter()
                            .fold(bias[row], |sum, (i, v)| sum + weights[base + i] * v)
                    })
                    .collect();

                // Gradient of the loss w.r.t. each row's logit.
                let diffs: Vec<f32> = if binary {
                    let target = if y == 1 { 1.0 } else { 0.0 };
                    vec![sigmoid(logits[0]) - target]
                } else {
                    softmax(&logits)
                        .into_iter()
                        .enumerate()
                        .map(|(c, p)| p - if c == y { 1.0 } else { 0.0 })
                        .collect()
                };

                for (row, diff) in diffs.into_iter().enumerate() {
                    let base = row * dim;
                    for (i, v) in features {
                        *grad_w.entry(base + i).or_insert(0.0) += diff * v * weight;
                    }
                    grad_b[row] += diff * weight;
                }
                batch_weight += weight;
            }
            if batch_weight == 0.0 {
                continue;
            }

            let inv = 1.0 / batch_weight;
            if l2 > 0.0 {
                let decay = 1.0 - lr * l2;
                weights.iter_mut().for_each(|w| *w *= decay);
            }
            for (idx, g) in grad_w {
                weights[idx] -= lr * g * inv;
            }
            for (b, g) in bias.iter_mut().zip(grad_b) {
                *b -= lr * g * inv;
            }
        }
    }

    if weights.iter().chain(&bias).any(|w| !w.is_finite()) {
        return Err(TrainingError::Diverged);
    }

    Ok(ModelSnapshot {
        key: key.clone(),
        version,
        classes,
        vocabulary,
        weights,
        bias,
        trained_at: Utc::now(),
        training_example_count: set.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::training::{TaskType, NOT_TRANSACTION_CLASS, TRANSACTION_CLASS};

    fn detection_examples() -> Vec<TrainingExample> {
        let key = ModelKey::detection("u1");
        let mut out = Vec::new();
        for i in 0..30 {
            out.push(TrainingExample::new(
                key.clone(),
                format!("escrow closing inspection offer accepted unit {i}"),
                TRANSACTION_CLASS,
                LabelSource::User,
            ));
            out.push(TrainingExample::new(
                key.clone(),
                format!("weekly newsletter webinar unsubscribe promo {i}"),
                NOT_TRANSACTION_CLASS,
                LabelSource::User,
            ));
        }
        out
    }

    #[test]
    fn test_binary_training_separates_classes() {
        let key = ModelKey::detection("u1");
        let set = TrainingSet::from_examples(
            &detection_examples(),
            &TaskType::TransactionDetection.classes(),
            0.5,
        );
        let model = train_model(&key, 1, &set, &TrainingParams::default()).unwrap();
        model.validate().unwrap();

        let positive = model.predict("offer accepted, escrow closing next week");
        assert_eq!(positive.class, TRANSACTION_CLASS);
        assert!(positive.confidence > 0.7);

        let negative = model.predict("newsletter: join our webinar");
        assert_eq!(negative.class, NOT_TRANSACTION_CLASS);
    }

    #[test]
    fn test_training_is_deterministic() {
        let key = ModelKey::detection("u1");
        let set = TrainingSet::from_examples(
            &detection_examples(),
            &TaskType::TransactionDetection.classes(),
            0.5,
        );
        let a = train_model(&key, 1, &set, &TrainingParams::default()).unwrap();
        let b = train_model(&key, 1, &set, &TrainingParams::default()).unwrap();
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.bias, b.bias);
    }

    #[test]
    fn test_multiclass_training() {
        let key = ModelKey::transaction_type("u1");
        let mut examples = Vec::new();
        for i in 0..15 {
            for (text, label) in [
                ("lease agreement tenant monthly rent", "lease"),
                ("refinance rate lock lender appraisal", "refinance"),
                ("purchase offer buyer earnest money", "purchase"),
            ] {
                examples.push(TrainingExample::new(
                    key.clone(),
                    format!("{text} {i}"),
                    label,
                    LabelSource::User,
                ));
            }
        }
        let set = TrainingSet::from_examples(&examples, &TaskType::TransactionType.classes(), 0.5);
        let model = train_model(&key, 1, &set, &TrainingParams::default()).unwrap();
        assert_eq!(model.bias.len(), 5);
        assert_eq!(model.predict("tenant lease renewal").class, "lease");
        assert_eq!(model.predict("lender rate lock").class, "refinance");
    }

    #[test]
    fn test_user_label_overrides_llm_label() {
        let key = ModelKey::detection("u1");
        let llm = TrainingExample::new(key.clone(), "open house sunday", TRANSACTION_CLASS, LabelSource::Llm);
        let user = TrainingExample::new(
            key.clone(),
            "open house sunday",
            NOT_TRANSACTION_CLASS,
            LabelSource::User,
        );
        let later_llm = TrainingExample::new(key, "open house sunday", TRANSACTION_CLASS, LabelSource::Llm);

        let set = TrainingSet::from_examples(
            &[llm, user, later_llm],
            &TaskType::TransactionDetection.classes(),
            0.5,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.labels, vec![0]);
        assert_eq!(set.weights, vec![1.0]);
    }

    #[test]
    fn test_llm_examples_are_down_weighted() {
        let key = ModelKey::detection("u1");
        let example = TrainingExample::new(key, "escrow", TRANSACTION_CLASS, LabelSource::Llm);
        let set = TrainingSet::from_examples(&[example], &TaskType::TransactionDetection.classes(), 0.5);
        assert_eq!(set.weights, vec![0.5]);
    }

    #[test]
    fn test_single_class_rejected() {
        let key = ModelKey::detection("u1");
        let examples: Vec<_> = (0..20)
            .map(|i| {
                TrainingExample::new(key.clone(), format!("escrow {i}"), TRANSACTION_CLASS, LabelSource::User)
            })
            .collect();
        let set = TrainingSet::from_examples(&examples, &TaskType::TransactionDetection.classes(), 0.5);
        assert_eq!(
            train_model(&key, 1, &set, &TrainingParams::default()).unwrap_err(),
            TrainingError::SingleClass {
                class: TRANSACTION_CLASS.to_string()
            }
        );
    }

    #[test]
    fn test_insufficient_examples() {
        let key = ModelKey::detection("u1");
        let set = TrainingSet::from_examples(
            &detection_examples()[..4],
            &TaskType::TransactionDetection.classes(),
            0.5,
        );
        assert!(matches!(
            train_model(&key, 1, &set, &TrainingParams::default()),
            Err(TrainingError::InsufficientExamples { have: 4, need: 10 })
        ));
    }
}
