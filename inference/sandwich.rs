// inference/sandwich.rs

//! Cluster-robust (sandwich) covariance for a GEE state.
//!
//! `bread = (sum D'V^-1 D)^-1`, `meat = sum (D'V^-1 r)(D'V^-1 r)'` and the robust
//! covariance is `bread * meat * bread`. The bread is also returned on its own
//! as the model-based covariance.

use crate::gee::{self, ClusteredDesign, EstimationError, GeeState};

use ndarray::{Array2, Axis};
use ndarray_linalg::Inverse;

/// Largest entry of `A * A^-1 - I` accepted for the bread inverse.
const INVERSE_RESIDUAL_TOLERANCE: f64 = 1e-6;

/// Robust and model-based covariance of the coefficients.
#[derive(Debug, Clone)]
pub struct RobustCovariance {
    pub robust: Array2<f64>,
    pub naive: Array2<f64>,
}

pub fn estimate(
    design: &ClusteredDesign,
    state: &GeeState,
) -> Result<RobustCovariance, EstimationError> {
    let p = design.n_coefficients();
    let mut information = Array2::<f64>::zeros((p, p));
    let mut meat = Array2::<f64>::zeros((p, p));

    for cluster in 0..design.n_clusters() {
        let terms = gee::cluster_terms(
            design,
            state.link,
            &state.coefficients,
            state.alpha,
            cluster,
        )?;
        information += &terms.information;
        let score = terms.score.insert_axis(Axis(1));
        meat += &score.dot(&score.t());
    }

    let bread = invert_checked(&information)?;
    let mut robust = symmetrize(&bread.dot(&meat).dot(&bread));
    check_diagonal(&mut robust)?;

    log::debug!(
        "Sandwich covariance over {} clusters: robust diagonal {:?}",
        design.n_clusters(),
        robust.diag()
    );

    Ok(RobustCovariance {
        robust,
        naive: symmetrize(&bread),
    })
}

fn invert_checked(matrix: &Array2<f64>) -> Result<Array2<f64>, EstimationError> {
    if !matrix.iter().all(|v| v.is_finite()) {
        return Err(EstimationError::NumericalInstability(
            "the bread matrix contains non-finite entries".to_string(),
        ));
    }
    let inverse = matrix.inv().map_err(|e| {
        EstimationError::NumericalInstability(format!("the bread matrix is singular: {e}"))
    })?;

    let residual = matrix.dot(&inverse) - Array2::<f64>::eye(matrix.nrows());
    let worst = residual.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if !(worst < INVERSE_RESIDUAL_TOLERANCE) {
        return Err(EstimationError::NumericalInstability(format!(
            "the bread matrix is too ill-conditioned to invert (residual {worst:.3e})"
        )));
    }
    Ok(inverse)
}

fn symmetrize(matrix: &Array2<f64>) -> Array2<f64> {
    (matrix + &matrix.t()) * 0.5
}

/// Rejects non-finite or materially negative variances and clears rounding
/// noise below zero.
fn check_diagonal(covariance: &mut Array2<f64>) -> Result<(), EstimationError> {
    if !covariance.iter().all(|v| v.is_finite()) {
        return Err(EstimationError::NumericalInstability(
            "the robust covariance contains non-finite entries".to_string(),
        ));
    }
    let scale = covariance
        .diag()
        .iter()
        .fold(0.0f64, |acc, v| acc.max(v.abs()));
    for d in covariance.diag_mut().iter_mut() {
        if *d < -1e-12 * (1.0 + scale) {
            return Err(EstimationError::NumericalInstability(format!(
                "the robust covariance has a negative variance ({d:.3e})"
            )));
        }
        *d = d.max(0.0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClusterDataset, Reading, Strategy};
    use crate::gee::{STRATEGY_COVARIATE, reading_observation};
    use crate::model::{GeeConfig, LinkFunction, Observation};
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

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

    fn singleton_dataset() -> ClusterDataset<Reading> {
        let mut readings = Vec::new();
        for i in 0..15 {
            readings.push(reading(&format!("A{i}"), Strategy::Assisted, i % 2 == 0, i % 5 != 0));
            readings.push(reading(&format!("U{i}"), Strategy::Unaided, i % 2 == 0, i % 3 == 0));
        }
        ClusterDataset::from_records(readings).unwrap()
    }

    fn clustered_dataset() -> ClusterDataset<Reading> {
        let mut readings = Vec::new();
        for i in 0..30usize {
            let id = format!("P{i}");
            for j in 0..(1 + i % 4) {
                let truth = (i + j) % 2 == 0;
                readings.push(reading(&id, Strategy::Unaided, truth, (i * 3 + j) % 5 < 2));
                readings.push(reading(&id, Strategy::Assisted, truth, (i * 3 + j) % 5 < 3));
            }
        }
        ClusterDataset::from_records(readings).unwrap()
    }

    #[test]
    fn singleton_clusters_give_the_hc0_covariance() {
        let dataset = singleton_dataset();
        let design =
            ClusteredDesign::build(&dataset, &[STRATEGY_COVARIATE], reading_observation).unwrap();
        let fit = gee::fit_design(&design, &GeeConfig::default()).unwrap();

        // Heteroskedasticity-robust logistic covariance computed directly.
        let x = design.x();
        let mu = design.fitted_means(LinkFunction::Logit, &fit.coefficients);
        let weights = mu.mapv(|m| m * (1.0 - m));
        let residual = &design.y() - &mu;
        let information = (&x.t() * &weights).dot(&x);
        let meat = (&x.t() * &residual.mapv(|r| r * r)).dot(&x);
        let bread = information.inv().unwrap();
        let hc0 = bread.dot(&meat).dot(&bread);

        for (a, b) in fit.robust_covariance.iter().zip(hc0.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
        for (a, b) in fit.naive_covariance.iter().zip(bread.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn robust_covariance_is_symmetric_with_non_negative_variances() {
        let dataset = clustered_dataset();
        let design =
            ClusteredDesign::build(&dataset, &[STRATEGY_COVARIATE], reading_observation).unwrap();
        let fit = gee::fit_design(&design, &GeeConfig::default()).unwrap();

        let state = GeeState {
            link: fit.link,
            coefficients: fit.coefficients.clone(),
            alpha: fit.alpha,
            iterations: fit.iterations,
        };
        let covariance = estimate(&design, &state).unwrap();
        let robust = &covariance.robust;
        assert_eq!(robust.dim(), (2, 2));
        assert_eq!(robust[[0, 1]], robust[[1, 0]]);
        assert!(robust.diag().iter().all(|&d| d > 0.0));
        assert!(covariance.naive.diag().iter().all(|&d| d > 0.0));
        for (a, b) in robust.iter().zip(fit.robust_covariance.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn singular_bread_is_reported_not_returned_as_nan() {
        let dataset = clustered_dataset();
        // Two identical covariate columns make the information matrix singular.
        let design = ClusteredDesign::build(&dataset, &["first", "second"], |r: &Reading| {
            let s = r.strategy.indicator();
            Observation {
                outcome: if r.is_correct() { 1.0 } else { 0.0 },
                covariates: vec![s, s],
            }
        })
        .unwrap();
        let state = GeeState {
            link: LinkFunction::Logit,
            coefficients: Array1::zeros(3),
            alpha: 0.0,
            iterations: 0,
        };
        assert!(matches!(
            estimate(&design, &state),
            Err(EstimationError::NumericalInstability(_))
        ));
    }
}
