use chrono::NaiveDate;
use log::{Log, Metadata, Record as LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Simple logger implementation
pub struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &LogRecord) {
        println!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// How a variable's daily values collapse into one monthly value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Sum,
}

/// The fixed vocabulary of daily climate variables a station sheet may carry.
///
/// Declaration order is the column order used for every export.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Variable {
    #[serde(rename = "Tn")]
    #[value(name = "Tn")]
    MinTemp,
    #[serde(rename = "Tx")]
    #[value(name = "Tx")]
    MaxTemp,
    #[serde(rename = "Tavg")]
    #[value(name = "Tavg")]
    AvgTemp,
    #[serde(rename = "RH_avg")]
    #[value(name = "RH_avg")]
    Humidity,
    #[serde(rename = "RR")]
    #[value(name = "RR")]
    Precipitation,
    #[serde(rename = "ss")]
    #[value(name = "ss")]
    Sunshine,
    #[serde(rename = "ff_avg")]
    #[value(name = "ff_avg")]
    WindSpeed,
    #[serde(rename = "ddd_x")]
    #[value(name = "ddd_x")]
    WindDirection,
}

impl Variable {
    pub const COUNT: usize = 8;

    pub const ALL: [Variable; Variable::COUNT] = [
        Variable::MinTemp,
        Variable::MaxTemp,
        Variable::AvgTemp,
        Variable::Humidity,
        Variable::Precipitation,
        Variable::Sunshine,
        Variable::WindSpeed,
        Variable::WindDirection,
    ];

    /// Canonical column header in the source sheet.
    pub fn column(self) -> &'static str {
        match self {
            Variable::MinTemp => "Tn",
            Variable::MaxTemp => "Tx",
            Variable::AvgTemp => "Tavg",
            Variable::Humidity => "RH_avg",
            Variable::Precipitation => "RR",
            Variable::Sunshine => "ss",
            Variable::WindSpeed => "ff_avg",
            Variable::WindDirection => "ddd_x",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Variable::MinTemp => "Minimum temperature (°C)",
            Variable::MaxTemp => "Maximum temperature (°C)",
            Variable::AvgTemp => "Average temperature (°C)",
            Variable::Humidity => "Average humidity (%)",
            Variable::Precipitation => "Precipitation (mm)",
            Variable::Sunshine => "Sunshine duration (hours)",
            Variable::WindSpeed => "Average wind speed (m/s)",
            Variable::WindDirection => "Wind direction at max speed (°)",
        }
    }

    /// Precipitation accumulates over a month; everything else is averaged.
    pub fn aggregation(self) -> Aggregation {
        match self {
            Variable::Precipitation => Aggregation::Sum,
            _ => Aggregation::Mean,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_column(name: &str) -> Option<Variable> {
        Variable::ALL.into_iter().find(|v| v.column() == name)
    }
}

/// One value slot per variable, indexed by `Variable::index`.
pub type VariableValues = [Option<f64>; Variable::COUNT];

/// One day of station observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub year: i32,
    pub month: u32,
    pub values: VariableValues,
}

impl Observation {
    pub fn value(&self, variable: Variable) -> Option<f64> {
        self.values[variable.index()]
    }
}

/// The loaded sheet: daily rows plus the variables whose columns were present.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub observations: Vec<Observation>,
    pub variables: Vec<Variable>,
}

/// Monthly aggregate for a single (year, month)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyRecord {
    pub year: i32,
    pub month: u32,
    pub count: u32,
    pub values: BTreeMap<Variable, f64>,
}

/// Predicted values for one point of the forecast grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub year: i32,
    pub month: u32,
    pub date: NaiveDate,
    pub predictions: BTreeMap<Variable, f64>,
}

/// Years and months the user chose to keep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Selection {
    pub years: BTreeSet<i32>,
    pub months: BTreeSet<u32>,
}

impl Selection {
    /// Every distinct year and month present in the observations.
    pub fn all(observations: &[Observation]) -> Self {
        Self {
            years: observations.iter().map(|o| o.year).collect(),
            months: observations.iter().map(|o| o.month).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty() || self.months.is_empty()
    }

    pub fn contains(&self, year: i32, month: u32) -> bool {
        self.years.contains(&year) && self.months.contains(&month)
    }
}

/// Headline numbers shown on the summary cards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryMetrics {
    pub record_count: usize,
    pub year_range: Option<(i32, i32)>,
    pub variable_count: usize,
}

/// Descriptive statistics of one variable over daily readings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStats {
    pub variable: Variable,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; `None` with a single reading.
    pub std: Option<f64>,
    pub min: f64,
    pub p25: f64,
    pub median: f64,
    pub p75: f64,
    pub max: f64,
}

/// Configuration for model fitting
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub n_estimators: usize,
    pub seed: u64,
    pub test_ratio: f64,
    /// Variables with fewer usable monthly rows than this are not trained.
    pub min_rows: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_estimators: 180,
            seed: 42,
            test_ratio: 0.2,
            min_rows: 2,
        }
    }
}

/// Options applied while typing the raw sheet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoadOptions {
    /// Treat the station codes 8888 (not measured) and 9999 (no data) as
    /// missing. Off by default, so sums match the sheet as written.
    pub clean_sentinels: bool,
}

/// Configuration for a full dashboard run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PathBuf,
    pub sheet: String,
    pub load: LoadOptions,
    pub model: ModelConfig,
    pub forecast_start: i32,
    pub forecast_years: u32,
}

pub const DEFAULT_SHEET: &str = "Data Harian - Table";
pub const FORECAST_START_YEAR: i32 = 2025;
pub const FORECAST_YEARS: u32 = 51;

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("Data.xlsx"),
            sheet: DEFAULT_SHEET.to_string(),
            load: LoadOptions::default(),
            model: ModelConfig::default(),
            forecast_start: FORECAST_START_YEAR,
            forecast_years: FORECAST_YEARS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_columns_round_trip() {
        for variable in Variable::ALL {
            assert_eq!(Variable::from_column(variable.column()), Some(variable));
        }
        assert_eq!(Variable::from_column("ddd_car"), None);
    }

    #[test]
    fn only_precipitation_is_summed() {
        let summed: Vec<_> = Variable::ALL
            .into_iter()
            .filter(|v| v.aggregation() == Aggregation::Sum)
            .collect();
        assert_eq!(summed, vec![Variable::Precipitation]);
    }

    #[test]
    fn index_matches_declaration_order() {
        for (i, variable) in Variable::ALL.into_iter().enumerate() {
            assert_eq!(variable.index(), i);
        }
    }

    #[test]
    fn empty_selection_contains_nothing() {
        let selection = Selection::default();
        assert!(selection.is_empty());
        assert!(!selection.contains(2020, 1));
    }
}
