use crate::error::{PipelineError, Result};
use crate::structs::ForecastRecord;
use crate::train::TrainingReport;
use chrono::NaiveDate;
use log::debug;
use std::collections::BTreeMap;

/// Every (year, month) from `start_year` for `years` consecutive years, ascending.
///
/// # Errors
/// Returns `PipelineError::Data` if the last year does not fit in an `i32`.
pub fn forecast_grid(start_year: i32, years: u32) -> Result<Vec<(i32, u32)>> {
    let end_year = i32::try_from(years)
        .ok()
        .and_then(|years| start_year.checked_add(years))
        .ok_or_else(|| {
            PipelineError::Data(format!(
                "Forecast of {} years from {} overflows the year range",
                years, start_year
            ))
        })?;
    Ok((start_year..end_year)
        .flat_map(|year| (1..=12).map(move |month| (year, month)))
        .collect())
}

/// Applies every trained model to every grid point.
///
/// # Arguments
/// * `report` - Fitted models; skipped variables get no column
/// * `grid` - Future (year, month) pairs
///
/// # Returns
/// Returns one `ForecastRecord` per grid point, dated the first of the month.
///
/// # Errors
/// Returns `PipelineError::Data` for a month outside 1..=12 and
/// `PipelineError::Model` if a model rejects the feature rows.
pub fn forecast(report: &TrainingReport, grid: &[(i32, u32)]) -> Result<Vec<ForecastRecord>> {
    let features: Vec<Vec<f64>> = grid
        .iter()
        .map(|(year, month)| vec![*year as f64, *month as f64])
        .collect();

    let mut columns = Vec::with_capacity(report.models.len());
    for model in &report.models {
        columns.push((model.variable, model.predict(&features)?));
    }
    debug!(
        "Predicted {} variables over {} grid points",
        columns.len(),
        grid.len()
    );

    grid.iter()
        .enumerate()
        .map(|(i, &(year, month))| {
            let date = NaiveDate::from_ymd_opt(year, month, 1)
                .ok_or_else(|| PipelineError::Data(format!("Invalid grid point {}-{}", year, month)))?;
            let predictions = columns
                .iter()
                .map(|(variable, values)| (*variable, values[i]))
                .collect::<BTreeMap<_, _>>();
            Ok(ForecastRecord {
                year,
                month,
                date,
                predictions,
            })
        })
        .collect()
}
