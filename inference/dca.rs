//! Decision-curve analysis: net benefit of a strategy across threshold
//! probabilities, with the treat-all and treat-none references.
//!
//! `net_benefit = tp/n - fp/n * pt/(1 - pt)`

use crate::metrics::ConfusionMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute difference in net benefit below which two strategies tie.
pub const TIE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum DecisionCurveError {
    #[error("Threshold probability {0} is invalid; it must lie strictly between 0 and 1.")]
    InvalidThreshold(f64),

    #[error("Invalid decision-curve configuration: {0}")]
    InvalidConfiguration(String),
}

/// A sorted, de-duplicated set of threshold probabilities in (0, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdGrid {
    values: Vec<f64>,
}

impl ThresholdGrid {
    /// `count` evenly spaced thresholds from `min` to `max` inclusive.
    pub fn linspace(min: f64, max: f64, count: usize) -> Result<Self, DecisionCurveError> {
        if count == 0 {
            return Err(DecisionCurveError::InvalidConfiguration(
                "the threshold grid needs at least one point".to_string(),
            ));
        }
        if min > max {
            return Err(DecisionCurveError::InvalidConfiguration(format!(
                "threshold_min ({min}) exceeds threshold_max ({max})"
            )));
        }
        let values: Vec<f64> = if count == 1 {
            vec![min]
        } else {
            let step = (max - min) / (count - 1) as f64;
            (0..count)
                .map(|i| if i == count - 1 { max } else { min + step * i as f64 })
                .collect()
        };
        Self::from_values(values)
    }

    pub fn from_values<I>(values: I) -> Result<Self, DecisionCurveError>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values: Vec<f64> = values.into_iter().collect();
        if let Some(&bad) = values
            .iter()
            .find(|t| !(t.is_finite() && **t > 0.0 && **t < 1.0))
        {
            return Err(DecisionCurveError::InvalidThreshold(bad));
        }
        if values.is_empty() {
            return Err(DecisionCurveError::InvalidConfiguration(
                "the threshold grid is empty".to_string(),
            ));
        }
        values.sort_by(f64::total_cmp);
        values.dedup();
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DcaPoint {
    pub threshold: f64,
    pub net_benefit: f64,
}

fn threshold_odds(threshold: f64) -> f64 {
    threshold / (1.0 - threshold)
}

fn check_inputs(numerators: &[u64], n: u64) -> Result<(), DecisionCurveError> {
    if n == 0 {
        return Err(DecisionCurveError::InvalidConfiguration(
            "the number of patients must be positive".to_string(),
        ));
    }
    if numerators.iter().any(|&count| count > n) {
        return Err(DecisionCurveError::InvalidConfiguration(format!(
            "counts {numerators:?} exceed the number of patients ({n})"
        )));
    }
    Ok(())
}

/// Validates classifier counts; `tp + fp` must not exceed `n`.
fn check_counts(tp: u64, fp: u64, n: u64) -> Result<(), DecisionCurveError> {
    let called = tp.checked_add(fp).ok_or_else(|| {
        DecisionCurveError::InvalidConfiguration(format!(
            "counts tp = {tp} and fp = {fp} overflow when added"
        ))
    })?;
    check_inputs(&[tp, fp, called], n)
}

/// Net benefit at a single threshold.
pub fn net_benefit(tp: u64, fp: u64, n: u64, threshold: f64) -> Result<f64, DecisionCurveError> {
    check_counts(tp, fp, n)?;
    if !(threshold.is_finite() && threshold > 0.0 && threshold < 1.0) {
        return Err(DecisionCurveError::InvalidThreshold(threshold));
    }
    let n = n as f64;
    Ok(tp as f64 / n - fp as f64 / n * threshold_odds(threshold))
}

/// Net benefit over a grid given in any order, possibly with duplicates.
pub fn net_benefit_curve(
    tp: u64,
    fp: u64,
    n: u64,
    thresholds: &[f64],
) -> Result<Vec<DcaPoint>, DecisionCurveError> {
    let grid = ThresholdGrid::from_values(thresholds.iter().copied())?;
    curve_on_grid(tp, fp, n, &grid)
}

pub fn curve_on_grid(
    tp: u64,
    fp: u64,
    n: u64,
    grid: &ThresholdGrid,
) -> Result<Vec<DcaPoint>, DecisionCurveError> {
    check_counts(tp, fp, n)?;
    let n = n as f64;
    Ok(grid
        .values()
        .iter()
        .map(|&threshold| DcaPoint {
            threshold,
            net_benefit: tp as f64 / n - fp as f64 / n * threshold_odds(threshold),
        })
        .collect())
}

/// Net benefit of treating every patient: `prevalence - (1 - prevalence) * odds`.
pub fn treat_all_curve(
    positives: u64,
    n: u64,
    grid: &ThresholdGrid,
) -> Result<Vec<DcaPoint>, DecisionCurveError> {
    check_inputs(&[positives], n)?;
    let prevalence = positives as f64 / n as f64;
    Ok(grid
        .values()
        .iter()
        .map(|&threshold| DcaPoint {
            threshold,
            net_benefit: prevalence - (1.0 - prevalence) * threshold_odds(threshold),
        })
        .collect())
}

/// Net benefit of treating nobody, which is zero everywhere.
pub fn treat_none_curve(grid: &ThresholdGrid) -> Vec<DcaPoint> {
    grid.values()
        .iter()
        .map(|&threshold| DcaPoint {
            threshold,
            net_benefit: 0.0,
        })
        .collect()
}

/// Decision curve of one strategy with its own treat-all reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCurve {
    pub n: u64,
    pub prevalence: f64,
    pub confusion: ConfusionMatrix,
    pub points: Vec<DcaPoint>,
    pub treat_all: Vec<DcaPoint>,
}

impl StrategyCurve {
    pub fn new(confusion: &ConfusionMatrix, grid: &ThresholdGrid) -> Result<Self, DecisionCurveError> {
        let n = confusion.total();
        let points = curve_on_grid(confusion.true_positives, confusion.false_positives, n, grid)?;
        let treat_all = treat_all_curve(confusion.positives(), n, grid)?;
        Ok(Self {
            confusion: *confusion,
            n,
            prevalence: confusion.positives() as f64 / n as f64,
            points,
            treat_all,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Assisted,
    Unaided,
    Tie,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaxDelta {
    pub threshold: f64,
    /// Signed assisted minus unaided net benefit.
    pub value: f64,
}

/// Contiguous span of the grid (first to last) where assisted wins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRange {
    pub lower: f64,
    pub upper: f64,
    /// Number of grid points inside the span where assisted wins.
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionCurveComparison {
    pub thresholds: Vec<f64>,
    /// Assisted minus unaided net benefit at each threshold.
    pub delta: Vec<f64>,
    pub winners: Vec<Winner>,
    pub max_delta: MaxDelta,
    pub assisted_better_range: Option<ThresholdRange>,
    pub assisted: StrategyCurve,
    pub unaided: StrategyCurve,
}

/// Compares the decision curves of the assisted and unaided strategies.
pub fn compare(
    assisted: &ConfusionMatrix,
    unaided: &ConfusionMatrix,
    grid: &ThresholdGrid,
) -> Result<DecisionCurveComparison, DecisionCurveError> {
    let assisted_curve = StrategyCurve::new(assisted, grid)?;
    let unaided_curve = StrategyCurve::new(unaided, grid)?;

    let delta: Vec<f64> = assisted_curve
        .points
        .iter()
        .zip(&unaided_curve.points)
        .map(|(a, u)| a.net_benefit - u.net_benefit)
        .collect();
    let winners: Vec<Winner> = delta
        .iter()
        .map(|&d| {
            if d.abs() <= TIE_TOLERANCE {
                Winner::Tie
            } else if d > 0.0 {
                Winner::Assisted
            } else {
                Winner::Unaided
            }
        })
        .collect();

    // First index of the largest |delta|.
    let mut max_index = 0;
    for (i, d) in delta.iter().enumerate() {
        if d.abs() > delta[max_index].abs() {
            max_index = i;
        }
    }
    let max_delta = MaxDelta {
        threshold: grid.values()[max_index],
        value: delta[max_index],
    };

    let better: Vec<f64> = grid
        .values()
        .iter()
        .zip(&winners)
        .filter(|&(_, w)| *w == Winner::Assisted)
        .map(|(&t, _)| t)
        .collect();
    let assisted_better_range = match (better.first(), better.last()) {
        (Some(&lower), Some(&upper)) => Some(ThresholdRange {
            lower,
            upper,
            count: better.len(),
        }),
        _ => None,
    };

    log::info!(
        "Decision curves: max delta net benefit {:+.4} at threshold {:.3}; assisted better at {}/{} thresholds.",
        max_delta.value,
        max_delta.threshold,
        better.len(),
        grid.len()
    );

    Ok(DecisionCurveComparison {
        thresholds: grid.values().to_vec(),
        assisted: assisted_curve,
        unaided: unaided_curve,
        delta,
        winners,
        max_delta,
        assisted_better_range,
    })
}
