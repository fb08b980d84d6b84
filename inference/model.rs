use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;

/// Standard normal quantile used for the 95% Wald intervals.
pub const WALD_Z_95: f64 = 1.96;

/// Name given to the intercept column of every design.
pub const INTERCEPT_NAME: &str = "(Intercept)";

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkFunction {
    /// The logit link with binomial variance, for binary outcomes.
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    #[default]
    Logit,
}

impl LinkFunction {
    pub fn link(self, mu: f64) -> f64 {
        match self {
            LinkFunction::Logit => (mu / (1.0 - mu)).ln(),
        }
    }

    pub fn inverse_link(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                // Clamp eta to prevent overflow in exp
                let eta = eta.clamp(-700.0, 700.0);
                1.0 / (1.0 + (-eta).exp())
            }
        }
    }

    /// Variance function V(mu) of the response family.
    pub fn variance(self, mu: f64) -> f64 {
        match self {
            LinkFunction::Logit => mu * (1.0 - mu),
        }
    }

    /// Derivative of the mean with respect to the linear predictor, d mu / d eta.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            LinkFunction::Logit => {
                let mu = self.inverse_link(eta);
                mu * (1.0 - mu)
            }
        }
    }
}

/// One design row: a binary outcome and its covariates (intercept excluded).
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub outcome: f64,
    pub covariates: Vec<f64>,
}

/// Configuration of the GEE solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeeConfig {
    pub link: LinkFunction,
    /// Convergence threshold on the Euclidean norm of the coefficient update.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for GeeConfig {
    fn default() -> Self {
        Self {
            link: LinkFunction::Logit,
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

/// Sample description attached to every fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub n_observations: usize,
    pub n_clusters: usize,
    pub mean_cluster_size: f64,
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
}

impl SampleInfo {
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let n_observations: usize = sizes.iter().sum();
        let n_clusters = sizes.len();
        Self {
            n_observations,
            n_clusters,
            mean_cluster_size: if n_clusters == 0 {
                0.0
            } else {
                n_observations as f64 / n_clusters as f64
            },
            min_cluster_size: sizes.iter().copied().min().unwrap_or(0),
            max_cluster_size: sizes.iter().copied().max().unwrap_or(0),
        }
    }
}

/// A converged GEE fit with its cluster-robust covariance. A solver that hits
/// its iteration cap returns `EstimationError::DidNotConverge` instead.
///
/// Coefficients follow `covariate_names`, which always starts with the
/// intercept ([`INTERCEPT_NAME`]).
#[derive(Debug, Clone)]
pub struct GeeFit {
    pub link: LinkFunction,
    pub covariate_names: Vec<String>,
    pub coefficients: Array1<f64>,
    /// Exchangeable working-correlation parameter.
    pub alpha: f64,
    pub robust_covariance: Array2<f64>,
    /// Model-based covariance (the inverse of the bread).
    pub naive_covariance: Array2<f64>,
    pub iterations: usize,
    pub sample: SampleInfo,
}

/// Wald inference for one coefficient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub odds_ratio: f64,
    pub odds_ratio_ci_lower: f64,
    pub odds_ratio_ci_upper: f64,
}

impl GeeFit {
    pub fn intercept(&self) -> f64 {
        self.coefficients[0]
    }

    pub fn robust_standard_errors(&self) -> Array1<f64> {
        self.robust_covariance.diag().mapv(f64::sqrt)
    }

    pub fn coefficient_table(&self) -> Vec<CoefficientSummary> {
        let se = self.robust_standard_errors();
        self.covariate_names
            .iter()
            .zip(self.coefficients.iter().zip(se.iter()))
            .map(|(name, (&beta, &se))| {
                let z = beta / se;
                let ci_lower = beta - WALD_Z_95 * se;
                let ci_upper = beta + WALD_Z_95 * se;
                CoefficientSummary {
                    name: name.clone(),
                    estimate: beta,
                    std_error: se,
                    z,
                    p_value: two_sided_p_value(z),
                    ci_lower,
                    ci_upper,
                    odds_ratio: beta.exp(),
                    odds_ratio_ci_lower: ci_lower.exp(),
                    odds_ratio_ci_upper: ci_upper.exp(),
                }
            })
            .collect()
    }

    pub fn coefficient(&self, name: &str) -> Option<CoefficientSummary> {
        self.coefficient_table().into_iter().find(|c| c.name == name)
    }
}

/// Two-sided p-value of a standard normal z-statistic, 2 * (1 - Phi(|z|)).
pub fn two_sided_p_value(z: f64) -> f64 {
    erfc(z.abs() / SQRT_2)
}
