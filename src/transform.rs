use crate::structs::{
    Aggregation, ColumnStats, MonthlyRecord, Observation, Selection, SummaryMetrics, Variable,
};
use log::debug;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Keeps the observations whose year and month are both selected.
///
/// Filtering is idempotent: applying the same selection to an already
/// filtered slice returns the same rows. An empty selection keeps nothing.
///
/// # Arguments
/// * `observations` - Daily rows to filter
/// * `selection` - Chosen years and months
///
/// # Returns
/// Returns the matching rows in their original order.
pub fn filter_observations(observations: &[Observation], selection: &Selection) -> Vec<Observation> {
    let filtered: Vec<Observation> = observations
        .iter()
        .filter(|o| selection.contains(o.year, o.month))
        .cloned()
        .collect();
    debug!(
        "Filter kept {} of {} rows ({} years, {} months selected)",
        filtered.len(),
        observations.len(),
        selection.years.len(),
        selection.months.len()
    );
    filtered
}

/// Collapses daily observations into one record per (year, month).
///
/// Every variable is averaged except precipitation, which is summed. Missing
/// readings are skipped; a variable with no reading in a month is left out of
/// that month's record.
///
/// # Arguments
/// * `observations` - Daily rows, typically already filtered
/// * `variables` - Variables to reduce
///
/// # Returns
/// Returns a `Vec<MonthlyRecord>` sorted by year then month, with unique keys.
/// Zero input rows produce zero records.
pub fn aggregate_monthly(observations: &[Observation], variables: &[Variable]) -> Vec<MonthlyRecord> {
    let mut groups: HashMap<(i32, u32), Vec<&Observation>> = HashMap::new();
    for obs in observations {
        groups.entry((obs.year, obs.month)).or_default().push(obs);
    }
    debug!("Found {} unique year-month combinations", groups.len());

    let entries: Vec<_> = groups.into_iter().collect();
    let mut results: Vec<MonthlyRecord> = entries
        .into_par_iter()
        .map(|((year, month), rows)| {
            let values = variables
                .iter()
                .filter_map(|&variable| {
                    let readings: Vec<f64> =
                        rows.iter().filter_map(|o| o.value(variable)).collect();
                    reduce(&readings, variable.aggregation()).map(|v| (variable, v))
                })
                .collect::<BTreeMap<_, _>>();
            MonthlyRecord {
                year,
                month,
                count: rows.len() as u32,
                values,
            }
        })
        .collect();

    results.sort_by(|a, b| a.year.cmp(&b.year).then_with(|| a.month.cmp(&b.month)));
    results
}

fn reduce(readings: &[f64], aggregation: Aggregation) -> Option<f64> {
    if readings.is_empty() {
        return None;
    }
    let sum = readings.iter().sum::<f64>();
    Some(match aggregation {
        Aggregation::Sum => sum,
        Aggregation::Mean => sum / readings.len() as f64,
    })
}

/// Record count, year span and variable count for the summary cards.
pub fn summarize(observations: &[Observation], variables: &[Variable]) -> SummaryMetrics {
    let year_range = observations
        .iter()
        .map(|o| o.year)
        .fold(None, |range: Option<(i32, i32)>, year| match range {
            None => Some((year, year)),
            Some((lo, hi)) => Some((lo.min(year), hi.max(year))),
        });

    SummaryMetrics {
        record_count: observations.len(),
        year_range,
        variable_count: variables.len(),
    }
}

/// Count, mean, spread and quartiles of each variable over daily readings.
///
/// Missing readings are not counted. Variables with no reading at all are
/// left out of the table.
///
/// # Arguments
/// * `observations` - Daily rows to describe
/// * `variables` - Variables to include, in output order
///
/// # Returns
/// Returns one `ColumnStats` per variable that has at least one reading.
pub fn describe(observations: &[Observation], variables: &[Variable]) -> Vec<ColumnStats> {
    variables
        .iter()
        .filter_map(|&variable| {
            let mut readings: Vec<f64> = observations
                .iter()
                .filter_map(|o| o.value(variable))
                .collect();
            if readings.is_empty() {
                debug!("No readings of {} to describe", variable.column());
                return None;
            }
            readings.sort_by(f64::total_cmp);

            let count = readings.len();
            let mean = readings.iter().sum::<f64>() / count as f64;
            let std = (count > 1).then(|| {
                let variance =
                    readings.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
                variance.sqrt()
            });

            Some(ColumnStats {
                variable,
                count,
                mean,
                std,
                min: readings[0],
                p25: percentile(&readings, 25.0),
                median: percentile(&readings, 50.0),
                p75: percentile(&readings, 75.0),
                max: readings[count - 1],
            })
        })
        .collect()
}

/// Linearly interpolated percentile of already sorted, non-empty data.
fn percentile(sorted: &[f64], percentile: f64) -> f64 {
    let index = (percentile / 100.0) * (sorted.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let weight = index - lower as f64;
        sorted[lower] * (1.0 - weight) + sorted[upper] * weight
    }
}

/// Extracts the (year, month, value) points of one variable, skipping months
/// where it is missing.
pub fn series(records: &[MonthlyRecord], variable: Variable) -> Vec<(i32, u32, f64)> {
    records
        .iter()
        .filter_map(|r| r.values.get(&variable).map(|v| (r.year, r.month, *v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn obs(y: i32, m: u32, d: u32, tavg: Option<f64>, rr: Option<f64>) -> Observation {
        let mut values = [None; Variable::COUNT];
        values[Variable::AvgTemp.index()] = tavg;
        values[Variable::Precipitation.index()] = rr;
        Observation {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            year: y,
            month: m,
            values,
        }
    }

    fn sample() -> Vec<Observation> {
        vec![
            obs(2021, 2, 1, Some(27.0), Some(10.0)),
            obs(2020, 1, 1, Some(26.0), Some(5.0)),
            obs(2020, 1, 2, Some(28.0), Some(0.0)),
            obs(2020, 2, 1, None, Some(12.5)),
            obs(2020, 1, 3, Some(30.0), None),
        ]
    }

    const VARS: [Variable; 2] = [Variable::AvgTemp, Variable::Precipitation];

    #[test]
    fn sums_precipitation_and_averages_the_rest() {
        let monthly = aggregate_monthly(&sample(), &VARS);
        let jan = &monthly[0];
        assert_eq!((jan.year, jan.month), (2020, 1));
        assert_eq!(jan.count, 3);
        assert!((jan.values[&Variable::AvgTemp] - 28.0).abs() < 1e-12);
        assert!((jan.values[&Variable::Precipitation] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn groups_are_unique_and_ordered() {
        let monthly = aggregate_monthly(&sample(), &VARS);
        let keys: Vec<_> = monthly.iter().map(|r| (r.year, r.month)).collect();
        assert_eq!(keys, vec![(2020, 1), (2020, 2), (2021, 2)]);
    }

    #[test]
    fn all_missing_variable_is_absent_from_month() {
        let monthly = aggregate_monthly(&sample(), &VARS);
        let feb = &monthly[1];
        assert!(!feb.values.contains_key(&Variable::AvgTemp));
        assert_eq!(feb.values[&Variable::Precipitation], 12.5);
    }

    #[test]
    fn empty_input_aggregates_to_nothing() {
        assert!(aggregate_monthly(&[], &VARS).is_empty());
    }

    #[test]
    fn filter_is_idempotent() {
        let selection = Selection {
            years: [2020].into_iter().collect(),
            months: [1].into_iter().collect(),
        };
        let once = filter_observations(&sample(), &selection);
        let twice = filter_observations(&once, &selection);
        assert_eq!(once.len(), 3);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_selection_keeps_nothing() {
        assert!(filter_observations(&sample(), &Selection::default()).is_empty());
    }

    #[test]
    fn default_selection_keeps_everything() {
        let rows = sample();
        let selection = Selection::all(&rows);
        assert_eq!(filter_observations(&rows, &selection), rows);
    }

    #[test]
    fn summary_reports_year_span() {
        let summary = summarize(&sample(), &VARS);
        assert_eq!(summary.record_count, 5);
        assert_eq!(summary.year_range, Some((2020, 2021)));
        assert_eq!(summary.variable_count, 2);
        assert_eq!(summarize(&[], &VARS).year_range, None);
    }

    #[test]
    fn series_skips_missing_months() {
        let monthly = aggregate_monthly(&sample(), &VARS);
        let temps = series(&monthly, Variable::AvgTemp);
        assert_eq!(temps.len(), 2);
        assert_eq!(temps[1], (2021, 2, 27.0));
    }

    #[test]
    fn describe_matches_quartiles_and_sample_std() {
        let stats = describe(&sample(), &VARS);
        assert_eq!(stats.len(), 2);

        let tavg = &stats[0];
        assert_eq!(tavg.variable, Variable::AvgTemp);
        assert_eq!(tavg.count, 4);
        assert!((tavg.mean - 27.75).abs() < 1e-12);
        assert_eq!((tavg.min, tavg.max), (26.0, 30.0));
        // sorted 26, 27, 28, 30
        assert!((tavg.p25 - 26.75).abs() < 1e-12);
        assert!((tavg.median - 27.5).abs() < 1e-12);
        assert!((tavg.p75 - 28.5).abs() < 1e-12);
        let expected_std = (8.75_f64 / 3.0).sqrt();
        assert!((tavg.std.unwrap() - expected_std).abs() < 1e-12);

        let rr = &stats[1];
        assert_eq!(rr.count, 4);
        assert_eq!(rr.min, 0.0);
        assert_eq!(rr.max, 12.5);
    }

    #[test]
    fn describe_skips_variables_without_readings() {
        let rows = vec![obs(2020, 1, 1, Some(25.0), None)];
        let stats = describe(&rows, &VARS);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].std, None);
        assert_eq!(stats[0].median, 25.0);
        assert!(describe(&[], &VARS).is_empty());
    }
}
