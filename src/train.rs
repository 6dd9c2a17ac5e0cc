use crate::error::{PipelineError, Result};
use crate::structs::{ModelConfig, MonthlyRecord, Variable};
use crate::transform::series;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use smartcore::ensemble::random_forest_regressor::{
    RandomForestRegressor, RandomForestRegressorParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;
use std::fmt;

/// Forest over `[year, month]` feature rows.
pub type Forest = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// Number of features per row: year and month.
const N_FEATURES: usize = 2;

/// Held-out error of one fitted model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMetrics {
    pub n_train: usize,
    pub n_test: usize,
    pub rmse: Option<f64>,
    pub r2: Option<f64>,
}

/// A forest fitted to one variable's monthly series.
pub struct TrainedModel {
    pub variable: Variable,
    pub forest: Forest,
    pub metrics: ModelMetrics,
}

impl fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainedModel")
            .field("variable", &self.variable)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl TrainedModel {
    /// Predicts one value per `[year, month]` row.
    ///
    /// # Errors
    /// Returns `PipelineError::Model` if smartcore rejects the input.
    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        if x.is_empty() {
            return Ok(Vec::new());
        }
        self.forest
            .predict(&to_matrix(x))
            .map_err(|e| PipelineError::Model(format!("{}: {}", self.variable.column(), e)))
    }
}

/// Packs feature rows into a row-major smartcore matrix.
fn to_matrix(rows: &[Vec<f64>]) -> DenseMatrix<f64> {
    let mut flat = Vec::with_capacity(rows.len() * N_FEATURES);
    for row in rows {
        flat.extend_from_slice(row);
    }
    DenseMatrix::new(rows.len(), N_FEATURES, flat, false)
}

/// Fits a forest with the configured tree count and seed, splitting on both features.
pub fn fit_forest(x: &[Vec<f64>], y: &[f64], config: &ModelConfig) -> Result<Forest> {
    if x.is_empty() || x.len() != y.len() {
        return Err(PipelineError::Model(format!(
            "Cannot fit on {} feature rows and {} targets",
            x.len(),
            y.len()
        )));
    }
    let params = RandomForestRegressorParameters::default()
        .with_n_trees(config.n_estimators)
        .with_m(N_FEATURES)
        .with_seed(config.seed);
    let targets = y.to_vec();
    RandomForestRegressor::fit(&to_matrix(x), &targets, params)
        .map_err(|e| PipelineError::Model(e.to_string()))
}

/// A variable that was not trained, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedVariable {
    pub variable: Variable,
    pub rows: usize,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct TrainingReport {
    pub models: Vec<TrainedModel>,
    pub skipped: Vec<SkippedVariable>,
}

impl TrainingReport {
    pub fn variables(&self) -> Vec<Variable> {
        self.models.iter().map(|m| m.variable).collect()
    }

    pub fn model(&self, variable: Variable) -> Option<&TrainedModel> {
        self.models.iter().find(|m| m.variable == variable)
    }
}

enum Outcome {
    Trained(TrainedModel),
    Skipped(SkippedVariable),
}

/// Shuffles `0..n` with a seeded RNG and cuts it into train and test indices.
///
/// The test side gets `ceil(n * test_ratio)` rows, capped so at least one row
/// is left for training.
pub fn train_test_split(n: usize, test_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = ((n as f64) * test_ratio.clamp(0.0, 1.0)).ceil() as usize;
    let n_test = n_test.min(n.saturating_sub(1));
    let train = indices.split_off(n_test);
    (train, indices)
}

/// Root mean squared error; `None` for empty input.
pub fn rmse(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    if actual.is_empty() {
        return None;
    }
    let mse = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (p - a).powi(2))
        .sum::<f64>()
        / actual.len() as f64;
    Some(mse.sqrt())
}

/// Coefficient of determination.
///
/// Undefined, and reported as `None`, with fewer than two points or a target
/// with zero variance.
pub fn r2(predicted: &[f64], actual: &[f64]) -> Option<f64> {
    if actual.len() < 2 {
        return None;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot = actual.iter().map(|a| (a - mean).powi(2)).sum::<f64>();
    if ss_tot == 0.0 {
        return None;
    }
    let ss_res = predicted
        .iter()
        .zip(actual)
        .map(|(p, a)| (a - p).powi(2))
        .sum::<f64>();
    Some(1.0 - ss_res / ss_tot)
}

/// Fits one forest per variable on (year, month) features.
///
/// Each variable's monthly series is split 80/20 with the configured seed, the
/// forest is fit on the larger part and scored on the held-out part. Variables
/// with fewer than `config.min_rows` usable months are skipped and listed in
/// the report instead of failing the run.
///
/// # Arguments
/// * `records` - Monthly aggregates, sorted by year then month
/// * `variables` - Variables to model
/// * `config` - Ensemble size, seed, split ratio and minimum rows
///
/// # Returns
/// Returns a `TrainingReport` with models in the order of `variables`.
///
/// # Errors
/// Returns `PipelineError::Model` if a forest cannot be fit.
pub fn train_models(
    records: &[MonthlyRecord],
    variables: &[Variable],
    config: &ModelConfig,
) -> Result<TrainingReport> {
    info!(
        "Training {} models on {} monthly rows ({} trees each)",
        variables.len(),
        records.len(),
        config.n_estimators
    );

    let outcomes = variables
        .par_iter()
        .map(|&variable| train_variable(records, variable, config))
        .collect::<Result<Vec<Outcome>>>()?;

    let mut report = TrainingReport::default();
    for outcome in outcomes {
        match outcome {
            Outcome::Trained(model) => report.models.push(model),
            Outcome::Skipped(skipped) => report.skipped.push(skipped),
        }
    }
    Ok(report)
}

fn train_variable(records: &[MonthlyRecord], variable: Variable, config: &ModelConfig) -> Result<Outcome> {
    let points = series(records, variable);
    let min_rows = config.min_rows.max(2);
    if points.len() < min_rows {
        warn!(
            "Skipping {}: {} monthly rows, need at least {}",
            variable.column(),
            points.len(),
            min_rows
        );
        return Ok(Outcome::Skipped(SkippedVariable {
            variable,
            rows: points.len(),
            reason: format!("only {} monthly rows, need at least {}", points.len(), min_rows),
        }));
    }

    let x: Vec<Vec<f64>> = points
        .iter()
        .map(|(year, month, _)| vec![*year as f64, *month as f64])
        .collect();
    let y: Vec<f64> = points.iter().map(|(_, _, v)| *v).collect();

    let (train_idx, test_idx) = train_test_split(points.len(), config.test_ratio, config.seed);
    let train_x: Vec<Vec<f64>> = train_idx.iter().map(|&i| x[i].clone()).collect();
    let train_y: Vec<f64> = train_idx.iter().map(|&i| y[i]).collect();
    let test_x: Vec<Vec<f64>> = test_idx.iter().map(|&i| x[i].clone()).collect();
    let test_y: Vec<f64> = test_idx.iter().map(|&i| y[i]).collect();

    let forest = fit_forest(&train_x, &train_y, config)?;
    let predicted = if test_x.is_empty() {
        Vec::new()
    } else {
        forest
            .predict(&to_matrix(&test_x))
            .map_err(|e| PipelineError::Model(format!("{}: {}", variable.column(), e)))?
    };

    let metrics = ModelMetrics {
        n_train: train_x.len(),
        n_test: test_x.len(),
        rmse: rmse(&predicted, &test_y),
        r2: r2(&predicted, &test_y),
    };
    debug!(
        "{}: {} train rows, {} test rows",
        variable.column(),
        metrics.n_train,
        metrics.n_test
    );
    info!(
        "{}: RMSE={} R2={}",
        variable.column(),
        format_metric(metrics.rmse),
        format_metric(metrics.r2)
    );

    Ok(Outcome::Trained(TrainedModel {
        variable,
        forest,
        metrics,
    }))
}

pub fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}", v))
}
