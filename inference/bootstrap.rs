// inference/bootstrap.rs

//! # Patient-Level Bootstrap
//!
//! Resamples whole patients with replacement and recomputes a metric vector
//! on every replicate. Observations are never resampled individually, so
//! within-patient correlation is carried into every replicate.
//!
//! Replicate `b` draws its cluster indices from a generator seeded with
//! `seed ^ b`. Every replicate therefore depends only on the base seed and its
//! own index, and running the replicates on the rayon pool gives exactly the
//! same result as running them in order.

use crate::data::{Cluster, ClusterDataset};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid bootstrap configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metric returned {found} values but declares {expected} names.")]
    MetricLength { expected: usize, found: usize },

    #[error(
        "Paired bootstrap needs metrics with the same names, got {first:?} and {second:?}."
    )]
    IncompatibleMetrics {
        first: Vec<String>,
        second: Vec<String>,
    },
}

/// Configuration of a bootstrap run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub n_iterations: usize,
    /// Base seed. `None` draws one from entropy and marks the run unseeded;
    /// TOML spells it `seed = "entropy"`.
    #[serde(with = "seed_setting")]
    pub seed: Option<u64>,
    pub confidence_level: f64,
    /// Run replicates on the rayon pool.
    pub parallel: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_iterations: 1000,
            seed: Some(42),
            confidence_level: 0.95,
            parallel: true,
        }
    }
}

impl BootstrapConfig {
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.n_iterations == 0 {
            return Err(BootstrapError::InvalidConfiguration(
                "n_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(BootstrapError::InvalidConfiguration(format!(
                "confidence_level must lie strictly between 0 and 1, got {}",
                self.confidence_level
            )));
        }
        // Reports store the seed as a TOML integer.
        if let Some(seed) = self.seed.filter(|&seed| seed > i64::MAX as u64) {
            return Err(BootstrapError::InvalidConfiguration(format!(
                "seed must not exceed {}, got {seed}",
                i64::MAX
            )));
        }
        Ok(())
    }
}

/// TOML form of [`BootstrapConfig::seed`]: an integer, or the string
/// [`seed_setting::ENTROPY`] for an unseeded run.
pub mod seed_setting {
    use serde::de::{self, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub const ENTROPY: &str = "entropy";

    pub fn serialize<S>(seed: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match seed {
            Some(seed) => serializer.serialize_u64(*seed),
            None => serializer.serialize_str(ENTROPY),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(SeedVisitor)
    }

    struct SeedVisitor;

    impl Visitor<'_> for SeedVisitor {
        type Value = Option<u64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a non-negative integer seed or \"{ENTROPY}\"")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
            Ok(Some(value))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
            u64::try_from(value)
                .map(Some)
                .map_err(|_| E::invalid_value(Unexpected::Signed(value), &self))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
            if value == ENTROPY {
                Ok(None)
            } else {
                Err(E::invalid_value(Unexpected::Str(value), &self))
            }
        }
    }
}

/// The patients drawn for one replicate, borrowed from the source dataset.
/// A patient drawn several times appears several times.
#[derive(Debug)]
pub struct Replicate<'a, R> {
    clusters: Vec<&'a Cluster<R>>,
}

impl<'a, R> Replicate<'a, R> {
    /// Every patient exactly once, in cohort order.
    pub fn full(dataset: &'a ClusterDataset<R>) -> Self {
        Self {
            clusters: dataset.clusters().iter().collect(),
        }
    }

    pub fn drawn(dataset: &'a ClusterDataset<R>, indices: &[usize]) -> Self {
        Self {
            clusters: indices.iter().map(|&i| dataset.cluster(i)).collect(),
        }
    }

    pub fn clusters(&self) -> &[&'a Cluster<R>] {
        &self.clusters
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// A statistic vector computed from a set of patients.
pub trait ReplicateMetric<R>: Sync {
    /// Names of the values returned by [`ReplicateMetric::evaluate`], in order.
    fn names(&self) -> Vec<String>;

    fn evaluate(&self, replicate: &Replicate<'_, R>) -> Vec<f64>;
}

/// Cluster indices drawn for replicate `replicate` of a run with base seed
/// `seed`.
pub fn draw_cluster_indices(seed: u64, replicate: usize, n_clusters: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed ^ replicate as u64);
    (0..n_clusters).map(|_| rng.gen_range(0..n_clusters)).collect()
}

/// Summary of one metric over the replicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub name: String,
    /// Value on the full, unresampled dataset.
    pub estimate: f64,
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator); NaN for one replicate.
    pub std: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Per-replicate values in replicate order.
    #[serde(skip)]
    pub samples: Vec<f64>,
}

impl MetricSummary {
    fn from_samples(name: &str, estimate: f64, samples: Vec<f64>, confidence_level: f64) -> Self {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let std = if samples.len() > 1 {
            (samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            f64::NAN
        };

        let mut sorted = samples.clone();
        sorted.sort_by(f64::total_cmp);
        let tail = (1.0 - confidence_level) / 2.0;

        Self {
            name: name.to_string(),
            estimate,
            mean,
            std,
            ci_lower: percentile(&sorted, tail),
            ci_upper: percentile(&sorted, 1.0 - tail),
            samples,
        }
    }
}

/// Empirical quantile of sorted values, interpolating linearly between order
/// statistics at position `(n - 1) * q`.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * q.clamp(0.0, 1.0);
            let lower = h.floor() as usize;
            let upper = h.ceil() as usize;
            sorted[lower] + (h - lower as f64) * (sorted[upper] - sorted[lower])
        }
    }
}

/// Result of a bootstrap run over one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub n_iterations: usize,
    pub n_clusters: usize,
    pub confidence_level: f64,
    /// Base seed actually used.
    pub seed: u64,
    /// False when the seed was drawn from entropy.
    pub seeded: bool,
    pub metrics: Vec<MetricSummary>,
}

impl BootstrapSummary {
    pub fn metric(&self, name: &str) -> Option<&MetricSummary> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Bootstrap distribution of `first - second` for one metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSummary {
    /// Fraction of replicate deltas on the other side of zero from the mean.
    pub p_value_approx: f64,
    /// The percentile interval excludes zero.
    pub significant: bool,
    pub summary: MetricSummary,
}

impl DeltaSummary {
    fn new(summary: MetricSummary) -> Self {
        let n = summary.samples.len() as f64;
        let opposite = if summary.mean > 0.0 {
            summary.samples.iter().filter(|&&d| d <= 0.0).count()
        } else {
            summary.samples.iter().filter(|&&d| d >= 0.0).count()
        };
        let significant = summary.ci_lower > 0.0 || summary.ci_upper < 0.0;
        Self {
            p_value_approx: opposite as f64 / n,
            significant,
            summary,
        }
    }
}

/// Two metrics evaluated on the same replicates, with their difference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedBootstrapSummary {
    pub first: BootstrapSummary,
    pub second: BootstrapSummary,
    pub delta: Vec<DeltaSummary>,
}

impl PairedBootstrapSummary {
    pub fn delta(&self, name: &str) -> Option<&DeltaSummary> {
        self.delta.iter().find(|d| d.summary.name == name)
    }
}

/// Runs the patient-level bootstrap for one metric.
pub fn run<R, M>(
    dataset: &ClusterDataset<R>,
    metric: &M,
    config: &BootstrapConfig,
) -> Result<BootstrapSummary, BootstrapError>
where
    R: Sync,
    M: ReplicateMetric<R> + ?Sized,
{
    config.validate()?;
    let names = metric.names();
    let (seed, seeded) = resolve_seed(config.seed);
    log::info!(
        "Bootstrap: {} replicates over {} patients (seed {}).",
        config.n_iterations,
        dataset.n_clusters(),
        seed
    );

    let point = checked(metric.evaluate(&Replicate::full(dataset)), names.len())?;
    let replicates = internal::replicate_values(dataset, seed, config, |replicate| {
        metric.evaluate(replicate)
    });
    let replicates = replicates
        .into_iter()
        .map(|values| checked(values, names.len()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BootstrapSummary {
        metrics: internal::summarize(&names, &point, &replicates, config.confidence_level),
        n_iterations: config.n_iterations,
        n_clusters: dataset.n_clusters(),
        confidence_level: config.confidence_level,
        seed,
        seeded,
    })
}

/// Runs the bootstrap for two metrics on shared replicates and summarises
/// their per-replicate difference `first - second`.
pub fn run_paired<R, A, B>(
    dataset: &ClusterDataset<R>,
    first: &A,
    second: &B,
    config: &BootstrapConfig,
) -> Result<PairedBootstrapSummary, BootstrapError>
where
    R: Sync,
    A: ReplicateMetric<R> + ?Sized,
    B: ReplicateMetric<R> + ?Sized,
{
    config.validate()?;
    let names = first.names();
    let second_names = second.names();
    if names != second_names {
        return Err(BootstrapError::IncompatibleMetrics {
            first: names,
            second: second_names,
        });
    }
    let (seed, seeded) = resolve_seed(config.seed);
    log::info!(
        "Paired bootstrap: {} replicates over {} patients (seed {}).",
        config.n_iterations,
        dataset.n_clusters(),
        seed
    );

    let full = Replicate::full(dataset);
    let point_first = checked(first.evaluate(&full), names.len())?;
    let point_second = checked(second.evaluate(&full), names.len())?;

    let pairs = internal::replicate_values(dataset, seed, config, |replicate| {
        (first.evaluate(replicate), second.evaluate(replicate))
    });
    let mut first_values = Vec::with_capacity(pairs.len());
    let mut second_values = Vec::with_capacity(pairs.len());
    for (a, b) in pairs {
        first_values.push(checked(a, names.len())?);
        second_values.push(checked(b, names.len())?);
    }

    let point_delta: Vec<f64> = point_first
        .iter()
        .zip(&point_second)
        .map(|(a, b)| a - b)
        .collect();
    let delta_values: Vec<Vec<f64>> = first_values
        .iter()
        .zip(&second_values)
        .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x - y).collect())
        .collect();

    let level = config.confidence_level;
    let summary = |metrics| BootstrapSummary {
        metrics,
        n_iterations: config.n_iterations,
        n_clusters: dataset.n_clusters(),
        confidence_level: level,
        seed,
        seeded,
    };

    Ok(PairedBootstrapSummary {
        first: summary(internal::summarize(&names, &point_first, &first_values, level)),
        second: summary(internal::summarize(&names, &point_second, &second_values, level)),
        delta: internal::summarize(&names, &point_delta, &delta_values, level)
            .into_iter()
            .map(DeltaSummary::new)
            .collect(),
    })
}

fn resolve_seed(seed: Option<u64>) -> (u64, bool) {
    match seed {
        Some(seed) => (seed, true),
        None => {
            // Kept below 2^63 so the seed fits a TOML integer.
            let seed = rand::random::<u64>() >> 1;
            log::warn!(
                "No bootstrap seed was given; drew seed {} from entropy. Results will not be reproducible unless this seed is reused.",
                seed
            );
            (seed, false)
        }
    }
}

fn checked(values: Vec<f64>, expected: usize) -> Result<Vec<f64>, BootstrapError> {
    if values.len() == expected {
        Ok(values)
    } else {
        Err(BootstrapError::MetricLength {
            expected,
            found: values.len(),
        })
    }
}

mod internal {
    use super::*;
    use rayon::prelude::*;

    /// Evaluates `evaluate` on every replicate, in replicate order.
    pub(super) fn replicate_values<R, T, F>(
        dataset: &ClusterDataset<R>,
        seed: u64,
        config: &BootstrapConfig,
        evaluate: F,
    ) -> Vec<T>
    where
        R: Sync,
        T: Send,
        F: Fn(&Replicate<'_, R>) -> T + Sync,
    {
        let n_clusters = dataset.n_clusters();
        let one = |b: usize| {
            let indices = draw_cluster_indices(seed, b, n_clusters);
            evaluate(&Replicate::drawn(dataset, &indices))
        };

        let values: Vec<T> = if config.parallel {
            (0..config.n_iterations).into_par_iter().map(one).collect()
        } else {
            (0..config.n_iterations).map(one).collect()
        };
        log::debug!("Finished {} bootstrap replicates.", values.len());
        values
    }

    pub(super) fn summarize(
        names: &[String],
        point: &[f64],
        replicates: &[Vec<f64>],
        confidence_level: f64,
    ) -> Vec<MetricSummary> {
        names
            .iter()
            .enumerate()
            .map(|(k, name)| {
                let samples: Vec<f64> = replicates.iter().map(|values| values[k]).collect();
                MetricSummary::from_samples(name, point[k], samples, confidence_level)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ClusterMember;
    use approx::assert_abs_diff_eq;

    #[derive(Debug, Clone)]
    struct Score {
        patient: String,
        value: f64,
    }

    impl ClusterMember for Score {
        fn cluster_key(&self) -> &str {
            &self.patient
        }
    }

    /// Mean value and patient count of a replicate.
    struct MeanScore;

    impl ReplicateMetric<Score> for MeanScore {
        fn names(&self) -> Vec<String> {
            vec!["mean".to_string(), "patients".to_string()]
        }

        fn evaluate(&self, replicate: &Replicate<'_, Score>) -> Vec<f64> {
            let values: Vec<f64> = replicate
                .clusters()
                .iter()
                .flat_map(|c| c.members().iter().map(|s| s.value))
                .collect();
            vec![
                values.iter().sum::<f64>() / values.len() as f64,
                replicate.len() as f64,
            ]
        }
    }

    struct Shifted(f64);

    impl ReplicateMetric<Score> for Shifted {
        fn names(&self) -> Vec<String> {
            MeanScore.names()
        }

        fn evaluate(&self, replicate: &Replicate<'_, Score>) -> Vec<f64> {
            let mut values = MeanScore.evaluate(replicate);
            values[0] += self.0;
            values
        }
    }

    fn scores() -> ClusterDataset<Score> {
        let records = (0..12).flat_map(|i| {
            (0..(1 + i % 3)).map(move |j| Score {
                patient: format!("P{i}"),
                value: (i * 2 + j) as f64,
            })
        });
        ClusterDataset::from_records(records).unwrap()
    }

    #[test]
    fn draws_cover_every_patient_slot_with_valid_indices() {
        for b in 0..1000 {
            let indices = draw_cluster_indices(0, b, 3);
            assert_eq!(indices.len(), 3);
            assert!(indices.iter().all(|&i| i < 3));
        }
        assert_eq!(draw_cluster_indices(7, 3, 50), draw_cluster_indices(7, 3, 50));
        assert_ne!(draw_cluster_indices(7, 3, 50), draw_cluster_indices(7, 4, 50));
    }

    #[test]
    fn percentile_interpolates_between_order_statistics() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
        assert_abs_diff_eq!(percentile(&sorted, 0.5), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.025), 1.1, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&sorted, 0.975), 4.9, epsilon = 1e-12);
        assert_eq!(percentile(&[7.0], 0.3), 7.0);
    }

    #[test]
    fn parallel_and_sequential_runs_are_identical() {
        let dataset = scores();
        let parallel = BootstrapConfig {
            n_iterations: 200,
            ..BootstrapConfig::default()
        };
        let sequential = BootstrapConfig {
            parallel: false,
            ..parallel.clone()
        };
        let a = run(&dataset, &MeanScore, &parallel).unwrap();
        let b = run(&dataset, &MeanScore, &sequential).unwrap();
        for (x, y) in a.metrics.iter().zip(&b.metrics) {
            assert_eq!(x.samples, y.samples);
            assert_eq!(x.ci_lower, y.ci_lower);
            assert_eq!(x.ci_upper, y.ci_upper);
        }
        assert!(a.seeded);
        assert_eq!(a.seed, 42);
    }

    #[test]
    fn summary_statistics_follow_the_replicates() {
        let dataset = scores();
        let config = BootstrapConfig {
            n_iterations: 300,
            seed: Some(11),
            ..BootstrapConfig::default()
        };
        let summary = run(&dataset, &MeanScore, &config).unwrap();

        let patients = summary.metric("patients").unwrap();
        // Every replicate has as many patients as the cohort.
        assert!(patients.samples.iter().all(|&n| n == 12.0));
        assert_eq!(patients.std, 0.0);

        let mean = summary.metric("mean").unwrap();
        assert_eq!(mean.samples.len(), 300);
        assert!(mean.ci_lower <= mean.mean && mean.mean <= mean.ci_upper);
        assert!(mean.std > 0.0);
        let full: Vec<f64> = dataset.observations().map(|s| s.value).collect();
        assert_abs_diff_eq!(
            mean.estimate,
            full.iter().sum::<f64>() / full.len() as f64,
            epsilon = 1e-12
        );
    }

    #[test]
    fn single_replicate_has_undefined_spread() {
        let config = BootstrapConfig {
            n_iterations: 1,
            ..BootstrapConfig::default()
        };
        let summary = run(&scores(), &MeanScore, &config).unwrap();
        let mean = summary.metric("mean").unwrap();
        assert!(mean.std.is_nan());
        assert_eq!(mean.ci_lower, mean.ci_upper);
    }

    #[test]
    fn paired_deltas_are_exact_replicate_differences() {
        let dataset = scores();
        let config = BootstrapConfig {
            n_iterations: 100,
            ..BootstrapConfig::default()
        };
        let paired = run_paired(&dataset, &Shifted(0.5), &MeanScore, &config).unwrap();
        let delta = paired.delta("mean").unwrap();

        for ((a, b), d) in paired.first.metrics[0]
            .samples
            .iter()
            .zip(&paired.second.metrics[0].samples)
            .zip(&delta.summary.samples)
        {
            assert_eq!(a - b, *d);
        }
        assert_abs_diff_eq!(delta.summary.estimate, 0.5, epsilon = 1e-12);
        assert!(delta.significant);
        assert_eq!(delta.p_value_approx, 0.0);

        // The second metric saw the same draws as a standalone run.
        let alone = run(&dataset, &MeanScore, &config).unwrap();
        assert_eq!(alone.metrics[0].samples, paired.second.metrics[0].samples);
    }

    #[test]
    fn unseeded_runs_record_the_drawn_seed() {
        let config = BootstrapConfig {
            n_iterations: 20,
            seed: None,
            ..BootstrapConfig::default()
        };
        let summary = run(&scores(), &MeanScore, &config).unwrap();
        assert!(!summary.seeded);

        let replay = BootstrapConfig {
            seed: Some(summary.seed),
            ..config
        };
        let again = run(&scores(), &MeanScore, &replay).unwrap();
        assert_eq!(summary.metrics[0].samples, again.metrics[0].samples);
    }

    #[test]
    fn invalid_settings_are_rejected_before_resampling() {
        let dataset = scores();
        let zero = BootstrapConfig {
            n_iterations: 0,
            ..BootstrapConfig::default()
        };
        assert!(matches!(
            run(&dataset, &MeanScore, &zero),
            Err(BootstrapError::InvalidConfiguration(_))
        ));
        for level in [0.0, 1.0, f64::NAN] {
            let config = BootstrapConfig {
                confidence_level: level,
                ..BootstrapConfig::default()
            };
            assert!(matches!(
                run(&dataset, &MeanScore, &config),
                Err(BootstrapError::InvalidConfiguration(_))
            ));
        }
        let huge_seed = BootstrapConfig {
            seed: Some(u64::MAX),
            ..BootstrapConfig::default()
        };
        assert!(huge_seed.validate().is_err());
    }
}
