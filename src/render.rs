use crate::error::{PipelineError, Result};
use crate::extract::DatasetCache;
use crate::forecast::{forecast, forecast_grid};
use crate::load::{FORECAST_FILE_NAME, FORECAST_MIME, forecast_csv_bytes};
use crate::structs::{
    ColumnStats, Dataset, ForecastRecord, MonthlyRecord, Observation, PipelineConfig, Selection,
    SummaryMetrics, Variable,
};
use crate::train::{ModelMetrics, SkippedVariable, TrainingReport, format_metric, train_models};
use crate::transform::{aggregate_monthly, describe, filter_observations, series, summarize};
use log::{debug, info};
use plotters::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

/// Daily rows shown in the data preview.
pub const PREVIEW_ROWS: usize = 5;

/// Selections whose models are kept between renders; the oldest is evicted.
pub const MAX_CACHED_SELECTIONS: usize = 8;

/// What the user picked for one render. `None` means "everything present".
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub years: Option<BTreeSet<i32>>,
    pub months: Option<BTreeSet<u32>>,
    pub history_variable: Option<Variable>,
    pub forecast_variable: Option<Variable>,
}

/// A (date, value) line for one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub variable: Variable,
    pub title: String,
    /// Fractional year (`year + (month - 1) / 12`) against value.
    pub points: Vec<(f64, f64)>,
}

/// In-memory file offered for download.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub file_name: &'static str,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// Everything that depends only on the dataset and the selection.
#[derive(Debug)]
pub struct Computed {
    pub summary: SummaryMetrics,
    pub variables: Vec<Variable>,
    /// First selected daily rows, in sheet order.
    pub preview: Vec<Observation>,
    pub describe: Vec<ColumnStats>,
    pub monthly: Vec<MonthlyRecord>,
    pub report: TrainingReport,
    pub forecast: Vec<ForecastRecord>,
}

/// Result of one render.
#[derive(Debug)]
pub struct Page {
    pub computed: Arc<Computed>,
    pub history: Option<ChartSeries>,
    pub prediction: Option<ChartSeries>,
    pub download: Option<Download>,
    pub notices: Vec<String>,
}

impl Page {
    pub fn summary(&self) -> &SummaryMetrics {
        &self.computed.summary
    }

    pub fn metrics(&self) -> Vec<(Variable, &ModelMetrics)> {
        self.computed
            .report
            .models
            .iter()
            .map(|m| (m.variable, &m.metrics))
            .collect()
    }

    pub fn skipped(&self) -> &[SkippedVariable] {
        &self.computed.report.skipped
    }

    /// Text for the summary cards, the model scores and any notices.
    pub fn summary_lines(&self) -> Vec<String> {
        let summary = self.summary();
        let years = match summary.year_range {
            Some((lo, hi)) => format!("{} - {}", lo, hi),
            None => "-".to_string(),
        };
        let mut lines = vec![
            format!("Records:   {}", summary.record_count),
            format!("Years:     {}", years),
            format!("Variables: {}", summary.variable_count),
        ];
        for (variable, metrics) in self.metrics() {
            lines.push(format!(
                "{:<7} RMSE={} R2={} (train={}, test={})",
                variable.column(),
                format_metric(metrics.rmse),
                format_metric(metrics.r2),
                metrics.n_train,
                metrics.n_test
            ));
        }
        for skipped in self.skipped() {
            lines.push(format!("{:<7} not trained: {}", skipped.variable.column(), skipped.reason));
        }
        lines.extend(self.notices.iter().map(|n| format!("Note: {}", n)));
        lines
    }

    /// The data preview as a fixed-width table, one line per daily row.
    pub fn preview_lines(&self) -> Vec<String> {
        let computed = &self.computed;
        let mut header = format!("{:<10}", "Tanggal");
        for variable in &computed.variables {
            header.push_str(&format!(" {:>8}", variable.column()));
        }
        let mut lines = vec![header];
        for obs in &computed.preview {
            let mut line = obs.date.format("%d-%m-%Y").to_string();
            for variable in &computed.variables {
                let cell = obs
                    .value(*variable)
                    .map_or_else(|| "-".to_string(), |v| format!("{:.1}", v));
                line.push_str(&format!(" {:>8}", cell));
            }
            lines.push(line);
        }
        lines
    }

    /// The descriptive statistics table, one line per variable.
    pub fn describe_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{:<7} {:>6} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
            "", "count", "mean", "std", "min", "25%", "50%", "75%", "max"
        )];
        for stats in &self.computed.describe {
            let std = stats
                .std
                .map_or_else(|| "-".to_string(), |v| format!("{:.2}", v));
            lines.push(format!(
                "{:<7} {:>6} {:>9.2} {:>9} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>9.2}",
                stats.variable.column(),
                stats.count,
                stats.mean,
                std,
                stats.min,
                stats.p25,
                stats.median,
                stats.p75,
                stats.max
            ));
        }
        lines
    }
}

/// A dashboard session: renders pages on demand and keeps what can be reused
/// between renders.
///
/// The raw dataset is cached on file modification time. Aggregates, models and
/// forecasts are cached for the last `MAX_CACHED_SELECTIONS` selections and
/// dropped whenever the dataset reloads.
pub struct Dashboard {
    config: PipelineConfig,
    datasets: DatasetCache,
    computed: VecDeque<(Selection, Arc<Computed>)>,
    computed_for: Option<Arc<Dataset>>,
    trainings: usize,
}

impl Dashboard {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            datasets: DatasetCache::new(),
            computed: VecDeque::with_capacity(MAX_CACHED_SELECTIONS),
            computed_for: None,
            trainings: 0,
        }
    }

    /// Number of times models have been trained in this session.
    pub fn trainings(&self) -> usize {
        self.trainings
    }

    pub fn cached_selections(&self) -> usize {
        self.computed.len()
    }

    pub fn dataset(&mut self) -> Result<Arc<Dataset>> {
        self.datasets
            .get_or_load(&self.config.input, &self.config.sheet, &self.config.load)
    }

    /// Runs load, filter, aggregate, train and forecast for one request.
    ///
    /// An empty selection or a selection without trainable data does not fail:
    /// the page comes back with empty charts and an explanatory notice.
    ///
    /// # Errors
    /// Returns error if the dataset cannot be loaded or a model cannot be fit.
    pub fn render(&mut self, request: &RenderRequest) -> Result<Page> {
        let dataset = self.dataset()?;
        if !self
            .computed_for
            .as_ref()
            .is_some_and(|d| Arc::ptr_eq(d, &dataset))
        {
            debug!("Dataset changed, dropping {} cached selections", self.computed.len());
            self.computed.clear();
            self.computed_for = Some(Arc::clone(&dataset));
        }

        let defaults = Selection::all(&dataset.observations);
        let selection = Selection {
            years: request.years.clone().unwrap_or(defaults.years),
            months: request.months.clone().unwrap_or(defaults.months),
        };

        let cached = self.computed.iter().position(|(s, _)| *s == selection);
        let computed = match cached.and_then(|pos| self.computed.remove(pos)) {
            Some((selection, computed)) => {
                debug!("Reusing models for unchanged selection");
                self.computed.push_back((selection, Arc::clone(&computed)));
                computed
            }
            None => {
                let computed = Arc::new(self.compute(&dataset, &selection)?);
                if self.computed.len() >= MAX_CACHED_SELECTIONS {
                    self.computed.pop_front();
                }
                self.computed.push_back((selection, Arc::clone(&computed)));
                computed
            }
        };

        let mut notices = Vec::new();
        if computed.summary.record_count == 0 {
            notices.push("No observations match the selected years and months".to_string());
        } else if computed.report.models.is_empty() {
            notices.push("Not enough monthly data to train any model".to_string());
        }

        let history = history_chart(&dataset, &computed, request.history_variable, &mut notices);
        let prediction = prediction_chart(&computed, request.forecast_variable, &mut notices);

        let download = if computed.report.models.is_empty() {
            None
        } else {
            Some(Download {
                file_name: FORECAST_FILE_NAME,
                mime: FORECAST_MIME,
                bytes: forecast_csv_bytes(&computed.forecast, &computed.report.variables())?,
            })
        };

        Ok(Page {
            computed,
            history,
            prediction,
            download,
            notices,
        })
    }

    fn compute(&mut self, dataset: &Dataset, selection: &Selection) -> Result<Computed> {
        let filtered = filter_observations(&dataset.observations, selection);
        let summary = summarize(&filtered, &dataset.variables);
        let variables = dataset.variables.clone();
        let preview = filtered.iter().take(PREVIEW_ROWS).cloned().collect();
        let describe = describe(&filtered, &dataset.variables);
        if filtered.is_empty() {
            info!("Selection is empty, skipping training");
            return Ok(Computed {
                summary,
                variables,
                preview,
                describe,
                monthly: Vec::new(),
                report: TrainingReport::default(),
                forecast: Vec::new(),
            });
        }

        let monthly = aggregate_monthly(&filtered, &dataset.variables);
        let report = train_models(&monthly, &dataset.variables, &self.config.model)?;
        self.trainings += 1;

        let forecast = if report.models.is_empty() {
            Vec::new()
        } else {
            let grid = forecast_grid(self.config.forecast_start, self.config.forecast_years)?;
            forecast(&report, &grid)?
        };

        Ok(Computed {
            summary,
            variables,
            preview,
            describe,
            monthly,
            report,
            forecast,
        })
    }
}

fn history_chart(
    dataset: &Dataset,
    computed: &Computed,
    requested: Option<Variable>,
    notices: &mut Vec<String>,
) -> Option<ChartSeries> {
    let variable = pick_variable(requested, &dataset.variables, "history", notices)?;
    let points: Vec<(f64, f64)> = series(&computed.monthly, variable)
        .into_iter()
        .map(|(year, month, value)| (fractional_year(year, month), value))
        .collect();
    if points.is_empty() {
        return None;
    }
    Some(ChartSeries {
        variable,
        title: format!("Monthly {}", variable.label()),
        points,
    })
}

fn prediction_chart(
    computed: &Computed,
    requested: Option<Variable>,
    notices: &mut Vec<String>,
) -> Option<ChartSeries> {
    let trained = computed.report.variables();
    let variable = pick_variable(requested, &trained, "prediction", notices)?;
    let points = computed
        .forecast
        .iter()
        .filter_map(|r| {
            r.predictions
                .get(&variable)
                .map(|v| (fractional_year(r.year, r.month), *v))
        })
        .collect();
    Some(ChartSeries {
        variable,
        title: format!("Predicted {}", variable.label()),
        points,
    })
}

fn pick_variable(
    requested: Option<Variable>,
    available: &[Variable],
    chart: &str,
    notices: &mut Vec<String>,
) -> Option<Variable> {
    match requested {
        Some(variable) if available.contains(&variable) => Some(variable),
        Some(variable) => {
            notices.push(format!(
                "{} is not available for the {} chart",
                variable.column(),
                chart
            ));
            None
        }
        None => available.first().copied(),
    }
}

fn fractional_year(year: i32, month: u32) -> f64 {
    year as f64 + (month as f64 - 1.0) / 12.0
}

fn chart_error<E: std::fmt::Display>(e: E) -> PipelineError {
    PipelineError::Chart(e.to_string())
}

/// Draws a line chart of `series` as an SVG file. An empty series draws nothing.
///
/// # Errors
/// Returns `PipelineError::Chart` if the backend fails to write the file.
pub fn render_line_chart(series: &ChartSeries, output_path: &Path) -> Result<()> {
    if series.points.is_empty() {
        return Ok(());
    }

    let (xs, ys): (Vec<f64>, Vec<f64>) = series.points.iter().copied().unzip();
    let xmin = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let xmax = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let ymin = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let ymax = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    // 5% padding, and a unit span for flat lines
    let xr = if xmax > xmin { xmax - xmin } else { 1.0 };
    let yr = if ymax > ymin { ymax - ymin } else { 1.0 };

    let root = SVGBackend::new(output_path, (1000, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(chart_error)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(12)
        .caption(&series.title, ("sans-serif", 22))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(
            (xmin - xr * 0.05)..(xmax + xr * 0.05),
            (ymin - yr * 0.05)..(ymax + yr * 0.05),
        )
        .map_err(chart_error)?;

    chart
        .configure_mesh()
        .x_desc("Year")
        .y_desc(series.variable.label())
        .x_label_formatter(&|x| format!("{:.0}", x))
        .axis_style(&BLACK.mix(0.6))
        .light_line_style(&BLACK.mix(0.06))
        .draw()
        .map_err(chart_error)?;

    chart
        .draw_series(LineSeries::new(series.points.iter().copied(), &BLUE))
        .map_err(chart_error)?;

    root.present().map_err(chart_error)?;
    debug!("Wrote chart {}", output_path.display());
    Ok(())
}
