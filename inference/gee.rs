// inference/gee.rs

//! # Generalized Estimating Equations for Clustered Binary Outcomes
//!
//! Fits a logit-linked binomial marginal model with an exchangeable working
//! correlation, treating each patient as one cluster. The procedure is:
//!
//! 1.  Ordinary logistic regression by IRLS, ignoring the clustering, gives the
//!     starting coefficients (`fit_independence`).
//! 2.  Fisher scoring on the GEE estimating equations. Every iteration
//!     re-estimates the exchangeable correlation `alpha` from pooled
//!     within-cluster products of Pearson residuals and takes the step
//!     `(sum D'V^-1 D)^-1 sum D'V^-1 r`.
//! 3.  Once the step norm drops below the tolerance, the sandwich estimator in
//!     `crate::sandwich` supplies the cluster-robust covariance.
//!
//! Degenerate strata (a constant outcome, or fitted probabilities pinned at 0 or
//! 1) are reported as errors instead of silently yielding infinite
//! coefficients.

use crate::data::{ClusterDataset, DataError, Reading};
use crate::model::{GeeConfig, GeeFit, INTERCEPT_NAME, LinkFunction, Observation, SampleInfo};
use crate::sandwich;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use std::ops::Range;
use thiserror::Error;

/// Name of the strategy covariate in every reader-study fit.
pub const STRATEGY_COVARIATE: &str = "assisted";

/// Bound on the magnitude of the exchangeable correlation.
pub const ALPHA_LIMIT: f64 = 0.99;

/// Below this binomial variance a fitted probability counts as saturated.
pub const SATURATION_VARIANCE: f64 = 1e-10;

/// Floor on the IRLS working weights.
const MIN_WEIGHT: f64 = 1e-6;

/// Floor on the variances entering the working covariance.
const MIN_VARIANCE: f64 = 1e-10;

/// A comprehensive error type for the GEE fit and its variance estimate.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(
        "The GEE solver did not converge within {max_iterations} iterations. Last coefficient update norm was {last_change:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },

    #[error(
        "Degenerate fit where {covariate} = {level}: the outcome has no variation there or its fitted probabilities saturate at 0 or 1."
    )]
    DegenerateFit { covariate: String, level: String },

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cohort error: {0}")]
    Data(#[from] DataError),
}

/// Maps one reading to its GEE row: a correct read is the outcome and the
/// strategy indicator is the sole covariate.
pub fn reading_observation(reading: &Reading) -> Observation {
    Observation {
        outcome: if reading.is_correct() { 1.0 } else { 0.0 },
        covariates: vec![reading.strategy.indicator()],
    }
}

/// The dense design of a clustered dataset. Rows are stored cluster by
/// cluster, so every cluster occupies one contiguous row range.
#[derive(Debug, Clone)]
pub struct ClusteredDesign {
    x: Array2<f64>,
    y: Array1<f64>,
    ranges: Vec<Range<usize>>,
    names: Vec<String>,
}

impl ClusteredDesign {
    /// Builds the design matrix (intercept first) from a cohort.
    pub fn build<R, F>(
        dataset: &ClusterDataset<R>,
        covariate_names: &[&str],
        covariates_fn: F,
    ) -> Result<Self, EstimationError>
    where
        F: Fn(&R) -> Observation,
    {
        let p = covariate_names.len() + 1;
        let n = dataset.n_observations();
        let mut x = Array2::zeros((n, p));
        let mut y = Array1::zeros(n);
        let mut ranges = Vec::with_capacity(dataset.n_clusters());

        let mut row = 0;
        for cluster in dataset.clusters() {
            let start = row;
            for record in cluster.members() {
                let observation = covariates_fn(record);
                if observation.covariates.len() != covariate_names.len() {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "an observation of patient '{}' has {} covariates but {} covariate names were given",
                        cluster.patient_id(),
                        observation.covariates.len(),
                        covariate_names.len()
                    )));
                }
                if observation.outcome != 0.0 && observation.outcome != 1.0 {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "outcome {} of patient '{}' is not binary",
                        observation.outcome,
                        cluster.patient_id()
                    )));
                }
                if !observation.covariates.iter().all(|v| v.is_finite()) {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "non-finite covariate value for patient '{}'",
                        cluster.patient_id()
                    )));
                }

                x[[row, 0]] = 1.0;
                for (j, &value) in observation.covariates.iter().enumerate() {
                    x[[row, j + 1]] = value;
                }
                y[row] = observation.outcome;
                row += 1;
            }
            ranges.push(start..row);
        }

        let mut names = Vec::with_capacity(p);
        names.push(INTERCEPT_NAME.to_string());
        names.extend(covariate_names.iter().map(|name| name.to_string()));

        Ok(Self {
            x,
            y,
            ranges,
            names,
        })
    }

    pub fn x(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_coefficients(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_clusters(&self) -> usize {
        self.ranges.len()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.len()).collect()
    }

    pub fn max_cluster_size(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Design rows and outcomes of one cluster.
    pub fn cluster_rows(&self, cluster: usize) -> (ArrayView2<'_, f64>, ArrayView1<'_, f64>) {
        let range = self.ranges[cluster].clone();
        (
            self.x.slice(s![range.clone(), ..]),
            self.y.slice(s![range]),
        )
    }

    pub fn fitted_means(&self, link: LinkFunction, beta: &Array1<f64>) -> Array1<f64> {
        self.x.dot(beta).mapv(|eta| link.inverse_link(eta))
    }
}

/// Coefficients and working correlation at the point where the solver stopped.
#[derive(Debug, Clone)]
pub struct GeeState {
    pub link: LinkFunction,
    pub coefficients: Array1<f64>,
    pub alpha: f64,
    pub iterations: usize,
}

/// Result of the independence (ordinary logistic) fit.
#[derive(Debug, Clone)]
pub struct IndependenceFit {
    pub coefficients: Array1<f64>,
    pub iterations: usize,
}

/// One cluster's (or the pooled) contribution to the estimating equations:
/// `information = D'V^-1 D` and `score = D'V^-1 r`.
#[derive(Debug, Clone)]
pub struct ClusterTerms {
    pub information: Array2<f64>,
    pub score: Array1<f64>,
}

/// Fits the exchangeable GEE on a cohort.
pub fn fit<R, F>(
    dataset: &ClusterDataset<R>,
    covariate_names: &[&str],
    covariates_fn: F,
    config: &GeeConfig,
) -> Result<GeeFit, EstimationError>
where
    F: Fn(&R) -> Observation,
{
    validate_config(config)?;
    let design = ClusteredDesign::build(dataset, covariate_names, covariates_fn)?;
    fit_design(&design, config)
}

/// Fits the exchangeable GEE on an already assembled design.
pub fn fit_design(design: &ClusteredDesign, config: &GeeConfig) -> Result<GeeFit, EstimationError> {
    validate_config(config)?;
    let link = config.link;
    let sample = SampleInfo::from_sizes(&design.cluster_sizes());
    log::info!(
        "Fitting exchangeable GEE: {} observations in {} clusters (cluster size {}..={}), {} coefficients.",
        sample.n_observations,
        sample.n_clusters,
        sample.min_cluster_size,
        sample.max_cluster_size,
        design.n_coefficients()
    );

    let strata = internal::outcome_strata(design)?;
    internal::check_outcome_variation(design, &strata)?;

    let start = internal::irls(design, config, &strata)?;
    log::debug!(
        "Independence start found after {} IRLS iterations: {:?}",
        start.iterations,
        start.coefficients
    );

    let mut beta = start.coefficients;
    let mut last_change = f64::INFINITY;
    for iter in 1..=config.max_iterations {
        let mu = design.fitted_means(link, &beta);
        internal::check_saturation(&strata, &mu, link)?;

        let alpha = estimate_alpha(design, link, &beta);
        if !alpha.is_finite() {
            return Err(EstimationError::NumericalInstability(format!(
                "working correlation became non-finite at iteration {iter}"
            )));
        }

        let equations = estimating_equations(design, link, &beta, alpha)?;
        let step = equations
            .information
            .solve_into(equations.score)
            .map_err(|e| {
                EstimationError::NumericalInstability(format!(
                    "the GEE information matrix could not be solved at iteration {iter}: {e}"
                ))
            })?;
        internal::ensure_finite(&step, iter)?;

        beta += &step;
        last_change = step.dot(&step).sqrt();
        log::debug!(
            "GEE iteration {}: alpha = {:.6}, |delta beta| = {:.3e}",
            iter,
            alpha,
            last_change
        );

        if last_change < config.tolerance {
            let mu = design.fitted_means(link, &beta);
            internal::check_saturation(&strata, &mu, link)?;

            let state = GeeState {
                link,
                alpha: estimate_alpha(design, link, &beta),
                coefficients: beta,
                iterations: iter,
            };
            let covariance = sandwich::estimate(design, &state)?;

            log::info!(
                "GEE converged after {} iterations (alpha = {:.4}).",
                state.iterations,
                state.alpha
            );
            return Ok(GeeFit {
                link,
                covariate_names: design.names().to_vec(),
                coefficients: state.coefficients,
                alpha: state.alpha,
                robust_covariance: covariance.robust,
                naive_covariance: covariance.naive,
                iterations: state.iterations,
                sample,
            });
        }
    }

    log::warn!(
        "GEE stopped after {} iterations without converging (last update norm {:.3e}).",
        config.max_iterations,
        last_change
    );
    Err(EstimationError::DidNotConverge {
        max_iterations: config.max_iterations,
        last_change,
    })
}

/// Ordinary logistic regression by IRLS, treating every observation as
/// independent.
pub fn fit_independence(
    design: &ClusteredDesign,
    config: &GeeConfig,
) -> Result<IndependenceFit, EstimationError> {
    validate_config(config)?;
    let strata = internal::outcome_strata(design)?;
    internal::check_outcome_variation(design, &strata)?;
    internal::irls(design, config, &strata)
}

/// Pooled moment estimate of the exchangeable correlation at `beta`.
///
/// Only clusters with at least two observations contribute pairs; with no
/// pairs at all the estimate is 0. The result is clamped to
/// [`alpha_bounds`] for the largest cluster.
pub fn estimate_alpha(design: &ClusteredDesign, link: LinkFunction, beta: &Array1<f64>) -> f64 {
    let mu = design.fitted_means(link, beta);
    let y = design.y();

    let mut product_sum = 0.0;
    let mut pairs = 0.0;
    for range in &design.ranges {
        let m = range.len();
        if m < 2 {
            continue;
        }
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for i in range.clone() {
            let e = (y[i] - mu[i]) / link.variance(mu[i]).max(MIN_VARIANCE).sqrt();
            sum += e;
            sum_sq += e * e;
        }
        // sum_{j<k} e_j e_k
        product_sum += 0.5 * (sum * sum - sum_sq);
        pairs += (m * (m - 1) / 2) as f64;
    }

    if pairs == 0.0 {
        return 0.0;
    }
    let (lower, upper) = alpha_bounds(design.max_cluster_size());
    (product_sum / pairs).clamp(lower, upper)
}

/// Range of `alpha` for which every exchangeable correlation matrix up to
/// `max_cluster_size` stays positive definite.
pub fn alpha_bounds(max_cluster_size: usize) -> (f64, f64) {
    if max_cluster_size < 2 {
        return (0.0, 0.0);
    }
    let lower = (-1.0 / (max_cluster_size as f64 - 1.0) + 1e-6).max(-ALPHA_LIMIT);
    (lower, ALPHA_LIMIT)
}

/// Exchangeable working covariance `A^1/2 R(alpha) A^1/2` for the given
/// variances.
pub fn working_covariance(variance: ArrayView1<f64>, alpha: f64) -> Array2<f64> {
    let m = variance.len();
    Array2::from_shape_fn((m, m), |(j, k)| {
        if j == k {
            variance[j]
        } else {
            alpha * (variance[j] * variance[k]).sqrt()
        }
    })
}

/// Closed-form inverse of [`working_covariance`].
///
/// `R^-1 = ((1 - alpha)^-1) (I - alpha / (1 + (m - 1) alpha) J)`, scaled by
/// `A^-1/2` on both sides.
pub fn working_covariance_inverse(
    variance: ArrayView1<f64>,
    alpha: f64,
) -> Result<Array2<f64>, EstimationError> {
    let m = variance.len();
    let a = 1.0 - alpha;
    let b = 1.0 + (m as f64 - 1.0) * alpha;
    if a <= 0.0 || b <= 0.0 {
        return Err(EstimationError::NumericalInstability(format!(
            "working correlation with alpha = {alpha} is singular for a cluster of size {m}"
        )));
    }
    let off_diagonal = alpha / (a * b);
    let scale = variance.mapv(|v| 1.0 / v.sqrt());
    Ok(Array2::from_shape_fn((m, m), |(j, k)| {
        let r = if j == k { 1.0 / a - off_diagonal } else { -off_diagonal };
        r * scale[j] * scale[k]
    }))
}

/// Contribution of one cluster to the estimating equations at `(beta, alpha)`.
pub fn cluster_terms(
    design: &ClusteredDesign,
    link: LinkFunction,
    beta: &Array1<f64>,
    alpha: f64,
    cluster: usize,
) -> Result<ClusterTerms, EstimationError> {
    let (x, y) = design.cluster_rows(cluster);
    let eta = x.dot(beta);
    let mu = eta.mapv(|e| link.inverse_link(e));
    let variance = mu.mapv(|m| link.variance(m).max(MIN_VARIANCE));
    let derivative = eta.mapv(|e| link.mu_eta(e));

    // D = diag(d mu / d eta) X
    let d = &x * &derivative.insert_axis(Axis(1));
    let v_inv = working_covariance_inverse(variance.view(), alpha)?;
    let dt_v_inv = d.t().dot(&v_inv);
    let residual = &y - &mu;

    Ok(ClusterTerms {
        information: dt_v_inv.dot(&d),
        score: dt_v_inv.dot(&residual),
    })
}

/// Sum of [`cluster_terms`] over all clusters.
pub fn estimating_equations(
    design: &ClusteredDesign,
    link: LinkFunction,
    beta: &Array1<f64>,
    alpha: f64,
) -> Result<ClusterTerms, EstimationError> {
    let p = design.n_coefficients();
    let mut total = ClusterTerms {
        information: Array2::zeros((p, p)),
        score: Array1::zeros(p),
    };
    for cluster in 0..design.n_clusters() {
        let terms = cluster_terms(design, link, beta, alpha, cluster)?;
        total.information += &terms.information;
        total.score += &terms.score;
    }
    Ok(total)
}

fn validate_config(config: &GeeConfig) -> Result<(), EstimationError> {
    if !(config.tolerance.is_finite() && config.tolerance > 0.0) {
        return Err(EstimationError::InvalidConfiguration(format!(
            "GEE tolerance must be a positive number, got {}",
            config.tolerance
        )));
    }
    if config.max_iterations == 0 {
        return Err(EstimationError::InvalidConfiguration(
            "GEE max_iterations must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// Internal module for stratum bookkeeping and the IRLS start.
mod internal {
    use super::*;

    /// Rows sharing one level of one binary column.
    pub(super) struct Stratum {
        covariate: String,
        level: String,
        rows: Vec<usize>,
    }

    impl Stratum {
        fn degenerate(&self) -> EstimationError {
            EstimationError::DegenerateFit {
                covariate: self.covariate.clone(),
                level: self.level.clone(),
            }
        }
    }

    /// The whole cohort (the intercept stratum) plus both levels of every
    /// binary covariate.
    pub(super) fn outcome_strata(design: &ClusteredDesign) -> Result<Vec<Stratum>, EstimationError> {
        let x = design.x();
        let mut strata = vec![Stratum {
            covariate: INTERCEPT_NAME.to_string(),
            level: "1".to_string(),
            rows: (0..x.nrows()).collect(),
        }];

        for (j, name) in design.names().iter().enumerate().skip(1) {
            let column = x.column(j);
            if !column.iter().all(|&v| v == 0.0 || v == 1.0) {
                continue;
            }
            for level in [0.0, 1.0] {
                let rows: Vec<usize> = column
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| v == level)
                    .map(|(i, _)| i)
                    .collect();
                if rows.is_empty() {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "binary covariate '{name}' never takes the value {level}, so its effect is not identifiable"
                    )));
                }
                strata.push(Stratum {
                    covariate: name.clone(),
                    level: format!("{level}"),
                    rows,
                });
            }
        }
        Ok(strata)
    }

    pub(super) fn check_outcome_variation(
        design: &ClusteredDesign,
        strata: &[Stratum],
    ) -> Result<(), EstimationError> {
        let y = design.y();
        for stratum in strata {
            let first = y[stratum.rows[0]];
            if stratum.rows.iter().all(|&i| y[i] == first) {
                log::warn!(
                    "Outcome is constant ({}) where {} = {}.",
                    first,
                    stratum.covariate,
                    stratum.level
                );
                return Err(stratum.degenerate());
            }
        }
        Ok(())
    }

    pub(super) fn check_saturation(
        strata: &[Stratum],
        mu: &Array1<f64>,
        link: LinkFunction,
    ) -> Result<(), EstimationError> {
        for stratum in strata {
            if stratum
                .rows
                .iter()
                .all(|&i| link.variance(mu[i]) < SATURATION_VARIANCE)
            {
                return Err(stratum.degenerate());
            }
        }
        Ok(())
    }

    pub(super) fn ensure_finite(values: &Array1<f64>, iter: usize) -> Result<(), EstimationError> {
        if values.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            log::error!("Non-finite coefficient update at iteration {}: {:?}", iter, values);
            Err(EstimationError::NumericalInstability(format!(
                "non-finite coefficient update at iteration {iter}"
            )))
        }
    }

    /// Iteratively reweighted least squares for the independence model,
    /// started from zero.
    pub(super) fn irls(
        design: &ClusteredDesign,
        config: &GeeConfig,
        strata: &[Stratum],
    ) -> Result<IndependenceFit, EstimationError> {
        let link = config.link;
        let x = design.x();
        let y = design.y();
        let mut beta = Array1::zeros(design.n_coefficients());
        let mut last_change = f64::INFINITY;

        for iter in 1..=config.max_iterations {
            let eta = x.dot(&beta);
            let mu = eta.mapv(|e| link.inverse_link(e));
            check_saturation(strata, &mu, link)?;

            let weights = eta.mapv(|e| link.mu_eta(e).max(MIN_WEIGHT));
            let z = &eta + &((&y - &mu) / &weights);

            let x_t_w = &x.t() * &weights;
            let hessian = x_t_w.dot(&x);
            let rhs = x_t_w.dot(&z);
            let next = hessian.solve_into(rhs).map_err(|e| {
                EstimationError::NumericalInstability(format!(
                    "the IRLS normal equations could not be solved at iteration {iter}: {e}"
                ))
            })?;
            ensure_finite(&next, iter)?;

            let step = &next - &beta;
            last_change = step.dot(&step).sqrt();
            beta = next;
            log::debug!("IRLS iteration {}: |delta beta| = {:.3e}", iter, last_change);

            if last_change < config.tolerance {
                return Ok(IndependenceFit {
                    coefficients: beta,
                    iterations: iter,
                });
            }
        }

        Err(EstimationError::DidNotConverge {
            max_iterations: config.max_iterations,
            last_change,
        })
    }
}
