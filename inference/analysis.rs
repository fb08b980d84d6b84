// inference/analysis.rs

//! # Reader-Study Analysis
//!
//! Runs every engine for each reader of a cohort and collects the results in
//! one serializable `AnalysisReport`:
//!
//! 1.  Patient-level confusion matrices and accuracy metrics per strategy.
//! 2.  Paired patient bootstrap of the patient-level metrics and of the
//!     lesion-level detection metrics (assisted minus unaided).
//! 3.  GEE fit of read correctness on the assisted indicator, with robust
//!     Wald inference.
//! 4.  Decision curves of both strategies from the patient-level matrices.

use crate::bootstrap::{self, BootstrapError, PairedBootstrapSummary};
use crate::config::{AnalysisConfig, ConfigError};
use crate::data::{ClusterDataset, DataError, Reading, Strategy};
use crate::dca::{self, DecisionCurveComparison, DecisionCurveError, ThresholdGrid};
use crate::gee::{self, EstimationError, STRATEGY_COVARIATE, reading_observation};
use crate::metrics::{
    self, ConfusionMatrix, DiagnosticMetrics, LesionCounts, LesionLevelMetrics, LesionMetrics,
    PatientLevelMetrics,
};
use crate::model::{CoefficientSummary, GeeFit, SampleInfo};

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Reader label for readings without a reader id.
pub const ANONYMOUS_READER: &str = "anonymous";

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Failed to write the analysis report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize the analysis report to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    DecisionCurve(#[from] DecisionCurveError),
    #[error("No readings were found for reader '{0}'.")]
    UnknownReader(String),
}

/// Point metrics of one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub strategy: Strategy,
    pub patients: ConfusionMatrix,
    pub patient_metrics: DiagnosticMetrics,
    pub lesions: LesionCounts,
    pub lesion_metrics: LesionMetrics,
}

/// Serializable view of a GEE fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeeReport {
    pub alpha: f64,
    pub iterations: usize,
    pub robust_covariance: Vec<Vec<f64>>,
    pub naive_covariance: Vec<Vec<f64>>,
    pub sample: SampleInfo,
    pub coefficients: Vec<CoefficientSummary>,
}

fn matrix_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

impl From<&GeeFit> for GeeReport {
    fn from(fit: &GeeFit) -> Self {
        Self {
            alpha: fit.alpha,
            iterations: fit.iterations,
            robust_covariance: matrix_rows(&fit.robust_covariance),
            naive_covariance: matrix_rows(&fit.naive_covariance),
            sample: fit.sample.clone(),
            coefficients: fit.coefficient_table(),
        }
    }
}

/// Cause of a failed GEE fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeeFailureKind {
    DidNotConverge,
    DegenerateFit,
    NumericalInstability,
    InvalidConfiguration,
    InvalidData,
}

impl From<&EstimationError> for GeeFailureKind {
    fn from(error: &EstimationError) -> Self {
        match error {
            EstimationError::DidNotConverge { .. } => Self::DidNotConverge,
            EstimationError::DegenerateFit { .. } => Self::DegenerateFit,
            EstimationError::NumericalInstability(_) => Self::NumericalInstability,
            EstimationError::InvalidConfiguration(_) => Self::InvalidConfiguration,
            EstimationError::Data(_) => Self::InvalidData,
        }
    }
}

/// GEE result of one reader. A fit that fails is recorded with its cause and
/// the reader's other results are kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GeeOutcome {
    Fitted(GeeReport),
    Failed {
        kind: GeeFailureKind,
        message: String,
    },
}

impl GeeOutcome {
    pub fn fitted(&self) -> Option<&GeeReport> {
        match self {
            Self::Fitted(report) => Some(report),
            Self::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<GeeFailureKind> {
        match self {
            Self::Fitted(_) => None,
            Self::Failed { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderReport {
    pub reader: String,
    pub n_readings: usize,
    pub n_patients: usize,
    pub assisted: StrategyMetrics,
    pub unaided: StrategyMetrics,
    /// Patient-level metrics; `first` is assisted, `second` unaided.
    pub patient_bootstrap: PairedBootstrapSummary,
    /// Lesion-level metrics; `first` is assisted, `second` unaided.
    pub lesion_bootstrap: PairedBootstrapSummary,
    pub gee: GeeOutcome,
    pub decision_curve: DecisionCurveComparison,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub config: AnalysisConfig,
    pub readers: Vec<ReaderReport>,
}

impl AnalysisReport {
    pub fn reader(&self, name: &str) -> Option<&ReaderReport> {
        self.readers.iter().find(|r| r.reader == name)
    }

    pub fn save(&self, path: &Path) -> Result<(), AnalysisError> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        log::info!("Saved analysis report to {}", path.display());
        Ok(())
    }
}

/// Splits readings by reader, preserving first-appearance order.
pub fn group_by_reader(readings: Vec<Reading>) -> Vec<(String, Vec<Reading>)> {
    let mut groups: Vec<(String, Vec<Reading>)> = Vec::new();
    for reading in readings {
        let name = reading
            .reader_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_READER.to_string());
        match groups.iter_mut().find(|(reader, _)| *reader == name) {
            Some((_, members)) => members.push(reading),
            None => groups.push((name, vec![reading])),
        }
    }
    groups
}

/// Keeps the readings of one reader.
pub fn select_reader(readings: Vec<Reading>, reader: &str) -> Result<Vec<Reading>, AnalysisError> {
    let selected: Vec<Reading> = readings
        .into_iter()
        .filter(|r| r.reader_id.as_deref().unwrap_or(ANONYMOUS_READER) == reader)
        .collect();
    if selected.is_empty() {
        return Err(AnalysisError::UnknownReader(reader.to_string()));
    }
    Ok(selected)
}

/// Analyses every reader of a cohort.
pub fn analyze_cohort(
    readings: Vec<Reading>,
    config: &AnalysisConfig,
) -> Result<AnalysisReport, AnalysisError> {
    config.validate()?;
    if readings.is_empty() {
        return Err(DataError::EmptyCohort.into());
    }
    let grid = config.dca.grid()?;

    let groups = group_by_reader(readings);
    log::info!("Analysing {} reader(s).", groups.len());

    let readers = groups
        .into_iter()
        .map(|(reader, readings)| analyze_reader(&reader, readings, config, &grid))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AnalysisReport {
        config: config.clone(),
        readers,
    })
}

/// Analyses the readings of a single reader.
pub fn analyze_reader(
    reader: &str,
    readings: Vec<Reading>,
    config: &AnalysisConfig,
    grid: &ThresholdGrid,
) -> Result<ReaderReport, AnalysisError> {
    let n_readings = readings.len();
    let dataset = ClusterDataset::from_records(readings)?;
    let tallies = metrics::lesion_tallies(&dataset)?;
    log::info!(
        "Reader '{}': {} readings from {} patients.",
        reader,
        n_readings,
        dataset.n_clusters()
    );

    let strategy_metrics = |strategy: Strategy| {
        let patients = metrics::patient_confusion(dataset.clusters(), strategy);
        let lesions = metrics::lesion_counts(tallies.clusters(), strategy);
        StrategyMetrics {
            strategy,
            patients,
            patient_metrics: DiagnosticMetrics::from(&patients),
            lesions,
            lesion_metrics: lesions.metrics(),
        }
    };
    let assisted = strategy_metrics(Strategy::Assisted);
    let unaided = strategy_metrics(Strategy::Unaided);

    let patient_bootstrap = bootstrap::run_paired(
        &dataset,
        &PatientLevelMetrics {
            strategy: Strategy::Assisted,
        },
        &PatientLevelMetrics {
            strategy: Strategy::Unaided,
        },
        &config.bootstrap,
    )?;
    let lesion_bootstrap = bootstrap::run_paired(
        &tallies,
        &LesionLevelMetrics {
            strategy: Strategy::Assisted,
        },
        &LesionLevelMetrics {
            strategy: Strategy::Unaided,
        },
        &config.bootstrap,
    )?;

    let gee = match gee::fit(
        &dataset,
        &[STRATEGY_COVARIATE],
        reading_observation,
        &config.gee,
    ) {
        Ok(fit) => {
            if let Some(effect) = fit.coefficient(STRATEGY_COVARIATE) {
                log::info!(
                    "Reader '{}': OR(assisted) = {:.3} [{:.3}, {:.3}], p = {:.4}",
                    reader,
                    effect.odds_ratio,
                    effect.odds_ratio_ci_lower,
                    effect.odds_ratio_ci_upper,
                    effect.p_value
                );
            }
            GeeOutcome::Fitted(GeeReport::from(&fit))
        }
        Err(e) => {
            log::warn!("Reader '{}': GEE fit failed: {}", reader, e);
            GeeOutcome::Failed {
                kind: GeeFailureKind::from(&e),
                message: e.to_string(),
            }
        }
    };

    let decision_curve = dca::compare(&assisted.patients, &unaided.patients, grid)?;

    Ok(ReaderReport {
        reader: reader.to_string(),
        n_readings,
        n_patients: dataset.n_clusters(),
        assisted,
        unaided,
        patient_bootstrap,
        lesion_bootstrap,
        gee,
        decision_curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapConfig;
    use tempfile::NamedTempFile;

    fn reading(reader: Option<&str>, patient: usize, strategy: Strategy, truth: bool, call: bool) -> Reading {
        Reading {
            patient_id: format!("P{patient:03}"),
            reader_id: reader.map(str::to_string),
            lesion_id: None,
            strategy,
            ground_truth: truth,
            prediction: call,
        }
    }

    /// Two lesions per patient. Unaided misses every third diseased lesion;
    /// assisted misses every seventh and over-calls every fifth healthy one.
    fn cohort(reader: Option<&str>) -> Vec<Reading> {
        let mut readings = Vec::new();
        for patient in 0..40 {
            for lesion in 0..2 {
                let k = patient * 2 + lesion;
                let truth = k % 2 == 0 || patient % 4 == 0;
                let unaided_call = if truth { k % 3 != 0 } else { k % 11 == 0 };
                let assisted_call = if truth { k % 7 != 0 } else { k % 5 == 0 };
                readings.push(reading(reader, patient, Strategy::Unaided, truth, unaided_call));
                readings.push(reading(reader, patient, Strategy::Assisted, truth, assisted_call));
            }
        }
        readings
    }

    fn quick_config() -> AnalysisConfig {
        AnalysisConfig {
            bootstrap: BootstrapConfig {
                n_iterations: 50,
                ..BootstrapConfig::default()
            },
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn readers_are_analysed_separately_in_order() {
        let mut readings = cohort(Some("R2"));
        readings.extend(cohort(Some("R1")));
        let report = analyze_cohort(readings, &quick_config()).unwrap();

        let names: Vec<&str> = report.readers.iter().map(|r| r.reader.as_str()).collect();
        assert_eq!(names, vec!["R2", "R1"]);
        for reader in &report.readers {
            assert_eq!(reader.n_patients, 40);
            assert_eq!(reader.n_readings, 160);
            assert_eq!(reader.decision_curve.thresholds.len(), 50);
            assert_eq!(reader.patient_bootstrap.first.n_iterations, 50);
            let gee = reader.gee.fitted().unwrap();
            assert_eq!(gee.coefficients[1].name, STRATEGY_COVARIATE);
        }
    }

    #[test]
    fn missing_reader_ids_form_one_anonymous_reader() {
        let report = analyze_cohort(cohort(None), &quick_config()).unwrap();
        assert_eq!(report.readers.len(), 1);
        let reader = report.reader(ANONYMOUS_READER).unwrap();
        assert_eq!(
            reader.assisted.patients.total(),
            reader.unaided.patients.total()
        );
        assert_eq!(reader.assisted.patients.total(), 40);
        assert!(reader.patient_bootstrap.delta("sensitivity").is_some());
        assert!(reader.lesion_bootstrap.delta("f1").is_some());
    }

    #[test]
    fn failed_gee_fit_keeps_every_reader_report() {
        let mut readings = cohort(Some("R1"));
        let perfect: Vec<Reading> = cohort(Some("R2"))
            .into_iter()
            .map(|mut r| {
                if r.strategy == Strategy::Assisted {
                    r.prediction = r.ground_truth;
                }
                r
            })
            .collect();
        readings.extend(perfect);

        let report = analyze_cohort(readings, &quick_config()).unwrap();
        assert_eq!(report.readers.len(), 2);

        let good = report.reader("R1").unwrap();
        assert!(good.gee.fitted().is_some());
        assert_eq!(good.gee.failure(), None);

        let perfect = report.reader("R2").unwrap();
        assert_eq!(perfect.gee.failure(), Some(GeeFailureKind::DegenerateFit));
        assert!(perfect.gee.fitted().is_none());
        assert_eq!(perfect.patient_bootstrap.first.n_iterations, 50);
        assert_eq!(perfect.decision_curve.thresholds.len(), 50);
        assert_eq!(perfect.assisted.patient_metrics.sensitivity, 1.0);

        let file = NamedTempFile::new().unwrap();
        report.save(file.path()).unwrap();
        let parsed: toml::Value =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        let readers = parsed["readers"].as_array().unwrap();
        assert_eq!(readers[0]["gee"]["status"].as_str(), Some("fitted"));
        assert_eq!(readers[1]["gee"]["status"].as_str(), Some("failed"));
        assert_eq!(readers[1]["gee"]["kind"].as_str(), Some("degenerate_fit"));
    }

    #[test]
    fn failure_kind_follows_the_estimation_error() {
        let not_converged = EstimationError::DidNotConverge {
            max_iterations: 100,
            last_change: 0.5,
        };
        assert_eq!(
            GeeFailureKind::from(&not_converged),
            GeeFailureKind::DidNotConverge
        );
        assert_eq!(
            GeeFailureKind::from(&EstimationError::NumericalInstability("singular".into())),
            GeeFailureKind::NumericalInstability
        );
        assert_eq!(
            GeeFailureKind::from(&EstimationError::Data(DataError::EmptyCohort)),
            GeeFailureKind::InvalidData
        );
    }

    #[test]
    fn unseeded_run_is_recorded_as_unseeded() {
        let mut config = quick_config();
        config.bootstrap.seed = None;
        let report = analyze_cohort(cohort(Some("R1")), &config).unwrap();
        let bootstrap = &report.readers[0].patient_bootstrap.first;
        assert!(!bootstrap.seeded);

        let file = NamedTempFile::new().unwrap();
        report.save(file.path()).unwrap();
        let parsed: toml::Value =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(parsed["config"]["bootstrap"]["seed"].as_str(), Some("entropy"));
        assert_eq!(
            parsed["readers"][0]["patient_bootstrap"]["first"]["seed"].as_integer(),
            Some(bootstrap.seed as i64)
        );
    }

    #[test]
    fn unknown_reader_selection_is_an_error() {
        let readings = cohort(Some("R1"));
        assert_eq!(select_reader(readings.clone(), "R1").unwrap().len(), 160);
        assert!(matches!(
            select_reader(readings, "R9"),
            Err(AnalysisError::UnknownReader(_))
        ));
    }

    #[test]
    fn report_is_written_as_toml() {
        let report = analyze_cohort(cohort(Some("R1")), &quick_config()).unwrap();
        let file = NamedTempFile::new().unwrap();
        report.save(file.path()).unwrap();

        let written = std::fs::read_to_string(file.path()).unwrap();
        assert!(written.contains("reader = \"R1\""));
        assert!(written.contains("odds_ratio"));
        assert!(written.contains("max_delta"));

        let parsed: toml::Value = toml::from_str(&written).unwrap();
        let readers = parsed["readers"].as_array().unwrap();
        assert_eq!(readers.len(), 1);
        assert_eq!(readers[0]["n_patients"].as_integer(), Some(40));
    }

    #[test]
    fn invalid_configuration_stops_before_any_work() {
        let mut config = quick_config();
        config.bootstrap.n_iterations = 0;
        assert!(matches!(
            analyze_cohort(cohort(None), &config),
            Err(AnalysisError::Config(_))
        ));
    }
}
