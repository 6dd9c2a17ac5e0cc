pub mod error;
pub mod extract;
pub mod forecast;
pub mod load;
pub mod render;
pub mod structs;
pub mod train;
pub mod transform;

// Re-export public API
pub use error::{PipelineError, Result};
pub use extract::{DatasetCache, build_dataset, load_dataset, read_table};
pub use forecast::{forecast, forecast_grid};
pub use load::{
    read_forecast_csv, write_forecast_csv, write_forecast_parquet, write_json, write_monthly_csv,
};
pub use render::{Dashboard, Page, RenderRequest, render_line_chart};
pub use structs::{
    ForecastRecord, LoadOptions, ModelConfig, MonthlyRecord, Observation, PipelineConfig,
    Selection, SimpleLogger, Variable,
};
pub use train::{TrainedModel, TrainingReport, fit_forest, train_models};
pub use transform::{aggregate_monthly, describe, filter_observations};
