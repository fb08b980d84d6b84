//! # Diagnostic Accuracy Metrics
//!
//! Confusion-matrix metrics at the patient level and detection metrics at the
//! lesion level. Both are exposed as [`ReplicateMetric`] implementations, so
//! the bootstrap can recompute them on any resampled set of patients.
//!
//! Patient-level calls use any-positive aggregation: inside one cluster and
//! one strategy, the patient is truth-positive if any reading is, and called
//! positive if any reading is. A patient drawn twice by the bootstrap is
//! counted twice.
//!
//! Every ratio with an empty denominator evaluates to 0.0.

use crate::bootstrap::{Replicate, ReplicateMetric};
use crate::data::{Cluster, ClusterDataset, DataError, LesionTally, Reading, Strategy};
use serde::{Deserialize, Serialize};

/// Output order of [`DiagnosticMetrics::to_vec`].
pub const DIAGNOSTIC_METRIC_NAMES: [&str; 4] = ["sensitivity", "specificity", "ppv", "npv"];

/// Output order of [`LesionMetrics::to_vec`].
pub const LESION_METRIC_NAMES: [&str; 3] = ["precision", "recall", "f1"];

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Counts of a binary classifier against a reference standard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl ConfusionMatrix {
    /// Tallies `(ground_truth, prediction)` pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (bool, bool)>,
    {
        let mut matrix = Self::default();
        for (truth, prediction) in pairs {
            matrix.record(truth, prediction);
        }
        matrix
    }

    pub fn record(&mut self, truth: bool, prediction: bool) {
        match (truth, prediction) {
            (true, true) => self.true_positives += 1,
            (false, true) => self.false_positives += 1,
            (true, false) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }

    /// Number of truth-positive cases.
    pub fn positives(&self) -> u64 {
        self.true_positives + self.false_negatives
    }

    pub fn sensitivity(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_positives)
    }

    pub fn ppv(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn npv(&self) -> f64 {
        ratio(self.true_negatives, self.true_negatives + self.false_negatives)
    }
}

/// Sensitivity, specificity and predictive values of one confusion matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticMetrics {
    pub sensitivity: f64,
    pub specificity: f64,
    pub ppv: f64,
    pub npv: f64,
}

impl DiagnosticMetrics {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.sensitivity, self.specificity, self.ppv, self.npv]
    }
}

impl From<&ConfusionMatrix> for DiagnosticMetrics {
    fn from(matrix: &ConfusionMatrix) -> Self {
        Self {
            sensitivity: matrix.sensitivity(),
            specificity: matrix.specificity(),
            ppv: matrix.ppv(),
            npv: matrix.npv(),
        }
    }
}

/// Patient-level confusion matrix of one strategy over a sequence of
/// clusters. Patients without a reading under `strategy` are skipped.
pub fn patient_confusion<'a, I>(clusters: I, strategy: Strategy) -> ConfusionMatrix
where
    I: IntoIterator<Item = &'a Cluster<Reading>>,
{
    let mut matrix = ConfusionMatrix::default();
    for cluster in clusters {
        let mut seen = false;
        let mut truth = false;
        let mut called = false;
        for reading in cluster.members().iter().filter(|r| r.strategy == strategy) {
            seen = true;
            truth |= reading.ground_truth;
            called |= reading.prediction;
        }
        if seen {
            matrix.record(truth, called);
        }
    }
    matrix
}

/// Patient-level sensitivity, specificity, PPV and NPV of one strategy.
#[derive(Debug, Clone, Copy)]
pub struct PatientLevelMetrics {
    pub strategy: Strategy,
}

impl ReplicateMetric<Reading> for PatientLevelMetrics {
    fn names(&self) -> Vec<String> {
        DIAGNOSTIC_METRIC_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn evaluate(&self, replicate: &Replicate<'_, Reading>) -> Vec<f64> {
        let matrix = patient_confusion(replicate.clusters().iter().copied(), self.strategy);
        DiagnosticMetrics::from(&matrix).to_vec()
    }
}

/// Lesion detection counts (true negatives are undefined for detection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LesionCounts {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
}

impl LesionCounts {
    pub fn add(&mut self, tally: &LesionTally) {
        self.true_positives += u64::from(tally.true_positives);
        self.false_positives += u64::from(tally.false_positives);
        self.false_negatives += u64::from(tally.false_negatives);
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let precision = self.precision();
        let recall = self.recall();
        if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        }
    }

    pub fn metrics(&self) -> LesionMetrics {
        LesionMetrics {
            precision: self.precision(),
            recall: self.recall(),
            f1: self.f1(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LesionMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl LesionMetrics {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.precision, self.recall, self.f1]
    }
}

/// Sums the tallies of one strategy over a sequence of clusters.
pub fn lesion_counts<'a, I>(clusters: I, strategy: Strategy) -> LesionCounts
where
    I: IntoIterator<Item = &'a Cluster<LesionTally>>,
{
    let mut counts = LesionCounts::default();
    for cluster in clusters {
        for tally in cluster.members().iter().filter(|t| t.strategy == strategy) {
            counts.add(tally);
        }
    }
    counts
}

/// Lesion-level precision, recall and F1 of one strategy.
#[derive(Debug, Clone, Copy)]
pub struct LesionLevelMetrics {
    pub strategy: Strategy,
}

impl ReplicateMetric<LesionTally> for LesionLevelMetrics {
    fn names(&self) -> Vec<String> {
        LESION_METRIC_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn evaluate(&self, replicate: &Replicate<'_, LesionTally>) -> Vec<f64> {
        lesion_counts(replicate.clusters().iter().copied(), self.strategy)
            .metrics()
            .to_vec()
    }
}

/// Per-patient, per-strategy lesion tallies derived from lesion-level
/// readings. Patients keep their cohort order; within a patient the assisted
/// tally precedes the unaided one. Strategies a patient was not read under
/// produce no tally.
pub fn lesion_tallies(dataset: &ClusterDataset<Reading>) -> Result<ClusterDataset<LesionTally>, DataError> {
    let mut tallies = Vec::new();
    for cluster in dataset.clusters() {
        for strategy in Strategy::ALL {
            let mut tally = LesionTally {
                patient_id: cluster.patient_id().to_string(),
                strategy,
                true_positives: 0,
                false_positives: 0,
                false_negatives: 0,
            };
            let mut seen = false;
            for reading in cluster.members().iter().filter(|r| r.strategy == strategy) {
                seen = true;
                match (reading.ground_truth, reading.prediction) {
                    (true, true) => tally.true_positives += 1,
                    (false, true) => tally.false_positives += 1,
                    (true, false) => tally.false_negatives += 1,
                    (false, false) => {}
                }
            }
            if seen {
                tallies.push(tally);
            }
        }
    }
    ClusterDataset::from_records(tallies)
}
