//! # Cohort Representation and Loading
//!
//! This module owns the in-memory cohort every inference engine reads. Records
//! are grouped into clusters by patient identifier, in first-appearance order,
//! and the resulting `ClusterDataset` is immutable: the GEE solver, the
//! bootstrap and the metric functions only ever borrow it.
//!
//! - Clusters are the unit of correlation and of resampling. A cluster is never
//!   split, and a dataset with fewer than two clusters is rejected because a
//!   cluster-robust variance is undefined for it.
//! - The tab-separated reader enforces a fixed schema (`patient_id`,
//!   `strategy`, `ground_truth`, `prediction`, optional `reader_id` and
//!   `lesion_id`). Failures are assumed to be user-input errors and the
//!   `DataError` variants say which column and line are at fault.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Fewest clusters for which a cluster-robust analysis is defined.
pub const MINIMUM_CLUSTERS: usize = 2;

/// The two reading conditions being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Reading performed with AI assistance.
    Assisted,
    /// Reading performed without assistance.
    Unaided,
}

impl Strategy {
    pub const ALL: [Strategy; 2] = [Strategy::Assisted, Strategy::Unaided];

    /// Value of the binary strategy covariate (1 for assisted, 0 for unaided).
    pub fn indicator(self) -> f64 {
        match self {
            Strategy::Assisted => 1.0,
            Strategy::Unaided => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Assisted => "assisted",
            Strategy::Unaided => "unaided",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assisted" | "1" => Ok(Strategy::Assisted),
            "unaided" | "0" => Ok(Strategy::Unaided),
            other => Err(DataError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Anything that belongs to exactly one patient cluster.
pub trait ClusterMember {
    /// Identifier of the patient this record belongs to.
    fn cluster_key(&self) -> &str;
}

/// One lesion-level read under one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reading {
    pub patient_id: String,
    pub reader_id: Option<String>,
    pub lesion_id: Option<String>,
    pub strategy: Strategy,
    pub ground_truth: bool,
    pub prediction: bool,
}

impl Reading {
    /// A read is correct when the call agrees with the reference standard.
    pub fn is_correct(&self) -> bool {
        self.ground_truth == self.prediction
    }
}

impl ClusterMember for Reading {
    fn cluster_key(&self) -> &str {
        &self.patient_id
    }
}

/// Per-patient lesion detection counts under one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LesionTally {
    pub patient_id: String,
    pub strategy: Strategy,
    pub true_positives: u32,
    pub false_positives: u32,
    pub false_negatives: u32,
}

impl ClusterMember for LesionTally {
    fn cluster_key(&self) -> &str {
        &self.patient_id
    }
}

/// All records contributed by one patient.
#[derive(Debug, Clone)]
pub struct Cluster<R> {
    patient_id: String,
    index: usize,
    members: Vec<R>,
}

impl<R> Cluster<R> {
    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    /// 0-based position of the patient in the cohort.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn members(&self) -> &[R] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// An ordered, immutable sequence of patient clusters.
#[derive(Debug, Clone)]
pub struct ClusterDataset<R> {
    clusters: Vec<Cluster<R>>,
    n_observations: usize,
}

impl<R: ClusterMember> ClusterDataset<R> {
    /// Groups records into clusters keyed by patient, preserving the order in
    /// which patients first appear. Records keep their relative order inside
    /// each cluster.
    pub fn from_records<I>(records: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = R>,
    {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut clusters: Vec<Cluster<R>> = Vec::new();
        let mut n_observations = 0usize;

        for record in records {
            let key = record.cluster_key();
            let index = match positions.get(key) {
                Some(&index) => index,
                None => {
                    let index = clusters.len();
                    positions.insert(key.to_string(), index);
                    clusters.push(Cluster {
                        patient_id: key.to_string(),
                        index,
                        members: Vec::new(),
                    });
                    index
                }
            };
            clusters[index].members.push(record);
            n_observations += 1;
        }

        if n_observations == 0 {
            return Err(DataError::EmptyCohort);
        }
        if clusters.len() < MINIMUM_CLUSTERS {
            return Err(DataError::TooFewClusters {
                found: clusters.len(),
                required: MINIMUM_CLUSTERS,
            });
        }

        log::debug!(
            "Built cluster dataset: {} observations in {} clusters",
            n_observations,
            clusters.len()
        );

        Ok(Self {
            clusters,
            n_observations,
        })
    }
}

impl<R> ClusterDataset<R> {
    pub fn clusters(&self) -> &[Cluster<R>] {
        &self.clusters
    }

    pub fn cluster(&self, index: usize) -> &Cluster<R> {
        &self.clusters[index]
    }

    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn n_observations(&self) -> usize {
        self.n_observations
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.clusters.iter().map(Cluster::len).collect()
    }

    /// Every record, cluster by cluster.
    pub fn observations(&self) -> impl Iterator<Item = &R> + '_ {
        self.clusters.iter().flat_map(|c| c.members.iter())
    }
}

/// A comprehensive error type for cohort construction and loading failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the tab-separated cohort file: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Missing value in required column '{column}' on line {line}.")]
    MissingValue { column: String, line: u64 },
    #[error("Column '{column}' on line {line} must be 0 or 1, found '{value}'.")]
    InvalidBinary {
        column: String,
        line: u64,
        value: String,
    },
    #[error("Unknown strategy '{0}'. Expected 'assisted' or 'unaided' (or 1/0).")]
    UnknownStrategy(String),
    #[error("The cohort is empty. At least one observation is required.")]
    EmptyCohort,
    #[error(
        "The cohort contains only {found} patient cluster(s), but at least {required} are required for cluster-robust inference."
    )]
    TooFewClusters { found: usize, required: usize },
}

/// Loads lesion-level readings from a tab-separated file with a header row.
pub fn load_readings(path: &Path) -> Result<Vec<Reading>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let columns = internal::ColumnMap::from_headers(reader.headers()?)?;
    let mut readings = Vec::new();
    for row in reader.records() {
        let row = row?;
        readings.push(columns.parse_row(&row)?);
    }

    if readings.is_empty() {
        return Err(DataError::EmptyCohort);
    }
    let duplicates = count_duplicates(&readings);
    if duplicates > 0 {
        log::warn!(
            "{} of {} rows in {} repeat an earlier row exactly; they are kept and counted again.",
            duplicates,
            readings.len(),
            path.display()
        );
    }
    log::info!(
        "Loaded {} readings from {}",
        readings.len(),
        path.display()
    );
    Ok(readings)
}

/// Number of readings identical in every field to an earlier one.
pub fn count_duplicates(readings: &[Reading]) -> usize {
    let mut seen = HashSet::with_capacity(readings.len());
    readings.iter().filter(|r| !seen.insert(*r)).count()
}

/// Internal module for the column-level parsing logic.
mod internal {
    use super::*;

    /// Positions of the schema columns within the header row.
    pub(super) struct ColumnMap {
        patient_id: usize,
        strategy: usize,
        ground_truth: usize,
        prediction: usize,
        reader_id: Option<usize>,
        lesion_id: Option<usize>,
    }

    impl ColumnMap {
        pub(super) fn from_headers(headers: &csv::StringRecord) -> Result<Self, DataError> {
            let find = |name: &str| headers.iter().position(|h| h == name);
            let require =
                |name: &str| find(name).ok_or_else(|| DataError::ColumnNotFound(name.to_string()));

            Ok(Self {
                patient_id: require("patient_id")?,
                strategy: require("strategy")?,
                ground_truth: require("ground_truth")?,
                prediction: require("prediction")?,
                reader_id: find("reader_id"),
                lesion_id: find("lesion_id"),
            })
        }

        pub(super) fn parse_row(&self, row: &csv::StringRecord) -> Result<Reading, DataError> {
            let line = row.position().map(|p| p.line()).unwrap_or(0);

            let required = |index: usize, column: &str| -> Result<String, DataError> {
                match row.get(index) {
                    Some(value) if !value.is_empty() => Ok(value.to_string()),
                    _ => Err(DataError::MissingValue {
                        column: column.to_string(),
                        line,
                    }),
                }
            };
            let optional = |index: Option<usize>| {
                index
                    .and_then(|i| row.get(i))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            let binary = |index: usize, column: &str| -> Result<bool, DataError> {
                let value = required(index, column)?;
                match value.as_str() {
                    "1" => Ok(true),
                    "0" => Ok(false),
                    _ => Err(DataError::InvalidBinary {
                        column: column.to_string(),
                        line,
                        value,
                    }),
                }
            };

            Ok(Reading {
                patient_id: required(self.patient_id, "patient_id")?,
                reader_id: optional(self.reader_id),
                lesion_id: optional(self.lesion_id),
                strategy: required(self.strategy, "strategy")?.parse()?,
                ground_truth: binary(self.ground_truth, "ground_truth")?,
                prediction: binary(self.prediction, "prediction")?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn reading(patient: &str, strategy: Strategy, truth: bool, call: bool) -> Reading {
        Reading {
            patient_id: patient.to_string(),
            reader_id: None,
            lesion_id: None,
            strategy,
            ground_truth: truth,
            prediction: call,
        }
    }

    #[test]
    fn clusters_follow_first_appearance_order() {
        let records = vec![
            reading("B", Strategy::Assisted, true, true),
            reading("A", Strategy::Assisted, false, false),
            reading("B", Strategy::Unaided, true, false),
            reading("C", Strategy::Unaided, false, true),
            reading("A", Strategy::Unaided, false, false),
        ];
        let dataset = ClusterDataset::from_records(records).unwrap();

        let ids: Vec<&str> = dataset.clusters().iter().map(|c| c.patient_id()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
        assert_eq!(dataset.cluster_sizes(), vec![2, 2, 1]);
        assert_eq!(dataset.n_observations(), 5);
        assert_eq!(
            dataset.n_observations(),
            dataset.cluster_sizes().iter().sum::<usize>()
        );
        for (i, cluster) in dataset.clusters().iter().enumerate() {
            assert_eq!(cluster.index(), i);
        }
        // Within-cluster order is the input order.
        assert_eq!(dataset.cluster(0).members()[1].strategy, Strategy::Unaided);
    }

    #[test]
    fn exact_duplicate_rows_are_counted() {
        let records = vec![
            reading("A", Strategy::Assisted, true, true),
            reading("A", Strategy::Assisted, true, true),
            reading("A", Strategy::Unaided, true, true),
            reading("B", Strategy::Assisted, true, true),
            reading("A", Strategy::Assisted, true, true),
        ];
        assert_eq!(count_duplicates(&records), 2);
        assert_eq!(count_duplicates(&records[2..4]), 0);
    }

    #[test]
    fn empty_cohort_is_rejected() {
        let result = ClusterDataset::<Reading>::from_records(Vec::new());
        assert!(matches!(result, Err(DataError::EmptyCohort)));
    }

    #[test]
    fn single_cluster_is_rejected() {
        let records = vec![
            reading("A", Strategy::Assisted, true, true),
            reading("A", Strategy::Unaided, true, false),
        ];
        let result = ClusterDataset::from_records(records);
        assert!(matches!(
            result,
            Err(DataError::TooFewClusters {
                found: 1,
                required: 2
            })
        ));
    }

    #[test]
    fn strategy_parsing_accepts_names_and_indicators() {
        assert_eq!("Assisted".parse::<Strategy>().unwrap(), Strategy::Assisted);
        assert_eq!(" unaided ".parse::<Strategy>().unwrap(), Strategy::Unaided);
        assert_eq!("1".parse::<Strategy>().unwrap(), Strategy::Assisted);
        assert_eq!("0".parse::<Strategy>().unwrap(), Strategy::Unaided);
        assert!(matches!(
            "ai".parse::<Strategy>(),
            Err(DataError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn load_readings_parses_schema_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "patient_id\treader_id\tlesion_id\tstrategy\tground_truth\tprediction"
        )
        .unwrap();
        writeln!(file, "P001\tEMS\tL1\tassisted\t1\t1").unwrap();
        writeln!(file, "P001\tEMS\tL2\tunaided\t1\t0").unwrap();
        writeln!(file, "P002\tEMS\t\tunaided\t0\t0").unwrap();
        file.flush().unwrap();

        let readings = load_readings(file.path()).unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].reader_id.as_deref(), Some("EMS"));
        assert_eq!(readings[1].lesion_id.as_deref(), Some("L2"));
        assert!(readings[1].ground_truth && !readings[1].prediction);
        assert_eq!(readings[2].lesion_id, None);
        assert!(readings[2].is_correct());

        let dataset = ClusterDataset::from_records(readings).unwrap();
        assert_eq!(dataset.cluster_sizes(), vec![2, 1]);
    }

    #[test]
    fn load_readings_reports_missing_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "patient_id\tstrategy\tprediction").unwrap();
        writeln!(file, "P001\tassisted\t1").unwrap();
        file.flush().unwrap();

        match load_readings(file.path()) {
            Err(DataError::ColumnNotFound(column)) => assert_eq!(column, "ground_truth"),
            other => panic!("expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn load_readings_rejects_non_binary_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "patient_id\tstrategy\tground_truth\tprediction").unwrap();
        writeln!(file, "P001\tassisted\t2\t1").unwrap();
        file.flush().unwrap();

        match load_readings(file.path()) {
            Err(DataError::InvalidBinary { column, value, .. }) => {
                assert_eq!(column, "ground_truth");
                assert_eq!(value, "2");
            }
            other => panic!("expected InvalidBinary, got {:?}", other),
        }
    }
}
