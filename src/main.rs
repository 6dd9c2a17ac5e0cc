use clap::Parser;
use lib::structs::{DEFAULT_SHEET, FORECAST_START_YEAR, FORECAST_YEARS};
use lib::{
    Dashboard, LoadOptions, ModelConfig, PipelineConfig, PipelineError, RenderRequest,
    SimpleLogger, Variable, render_line_chart, write_forecast_parquet, write_json,
    write_monthly_csv,
};
use log::debug;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

static LOGGER: SimpleLogger = SimpleLogger;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// input spreadsheet (.xlsx/.xls/.ods) or CSV export of the daily sheet
    #[arg(short, long, default_value = "Data.xlsx")]
    input_file: PathBuf,

    /// Worksheet holding the daily observations
    #[arg(short, long, default_value = DEFAULT_SHEET)]
    sheet: String,

    /// Output base name (will create dir containing forecast, monthly table and charts)
    #[arg(short, long, default_value = "output")]
    output: String,

    /// Years to keep (e.g., 2019,2020). If not specified, keeps every year present.
    #[arg(short, long, value_delimiter = ',')]
    years: Vec<i32>,

    /// Months to keep (1-12). If not specified, keeps every month present.
    #[arg(short, long, value_delimiter = ',')]
    months: Vec<u32>,

    /// Variable drawn on the historical chart
    #[arg(long)]
    history: Option<Variable>,

    /// Variable drawn on the predicted chart
    #[arg(long)]
    predict: Option<Variable>,

    /// Treat station codes 8888 and 9999 as missing readings
    #[arg(long, default_value = "false")]
    clean_sentinels: bool,

    /// Trees per forest
    #[arg(long, default_value_t = 180)]
    estimators: usize,

    /// Seed for the train/test split and bootstrap sampling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// First forecast year
    #[arg(long, default_value_t = FORECAST_START_YEAR)]
    forecast_start: i32,

    /// Number of forecast years
    #[arg(long, default_value_t = FORECAST_YEARS)]
    forecast_years: u32,

    /// Log level for output
    #[arg(long, default_value = "false")]
    debug: bool,
}

fn main() -> Result<(), PipelineError> {
    // Initialize timer and logger
    let total_start = Instant::now();
    log::set_logger(&LOGGER).map_err(|e| PipelineError::Data(e.to_string()))?;

    // Acquire CLI args
    let args = Args::parse();
    if args.debug {
        log::set_max_level(log::LevelFilter::Debug);
    } else {
        log::set_max_level(log::LevelFilter::Info);
    }

    println!("Climate dashboard");
    debug!(
        "Input file: {} | Sheet: {}",
        args.input_file.display(),
        args.sheet
    );

    let config = PipelineConfig {
        input: args.input_file.clone(),
        sheet: args.sheet.clone(),
        load: LoadOptions {
            clean_sentinels: args.clean_sentinels,
        },
        model: ModelConfig {
            n_estimators: args.estimators,
            seed: args.seed,
            ..ModelConfig::default()
        },
        forecast_start: args.forecast_start,
        forecast_years: args.forecast_years,
    };
    debug!("Model configuration: {:?}", config.model);

    let request = RenderRequest {
        years: (!args.years.is_empty()).then(|| args.years.iter().copied().collect()),
        months: (!args.months.is_empty()).then(|| args.months.iter().copied().collect()),
        history_variable: args.history,
        forecast_variable: args.predict,
    };

    println!("Starting render...");
    let render_start = Instant::now();
    let mut dashboard = Dashboard::new(config);
    let page = dashboard.render(&request)?;
    let render_time = render_start.elapsed();
    println!("Render completed in {:.2?}\n", render_time);

    for line in page.summary_lines() {
        println!("{}", line);
    }
    println!("\nPreview:");
    for line in page.preview_lines() {
        println!("{}", line);
    }
    println!("\nStatistics:");
    for line in page.describe_lines() {
        println!("{}", line);
    }

    // Create output directory
    let output_dir = PathBuf::from(format!("./output/{}", args.output));
    fs::create_dir_all(&output_dir)?;
    println!(
        "\nCreated output directory: {} | Writing output files...",
        output_dir.display()
    );
    let io_start = Instant::now();

    let computed = &page.computed;
    let dataset = dashboard.dataset()?;
    let monthly_path = output_dir.join("monthly.csv");
    write_monthly_csv(&computed.monthly, &dataset.variables, &monthly_path)?;
    debug!("  - {}", monthly_path.display());

    if let Some(download) = &page.download {
        let csv_path = output_dir.join(download.file_name);
        fs::write(&csv_path, &download.bytes)?;
        debug!("  - {}", csv_path.display());

        let variables = computed.report.variables();
        let json_path = output_dir.join("forecast.json");
        write_json(&computed.forecast, &json_path)?;
        debug!("  - {}", json_path.display());

        let parquet_path = output_dir.join("forecast.parquet");
        write_forecast_parquet(&computed.forecast, &variables, &parquet_path)?;
        debug!("  - {}", parquet_path.display());
    }

    let charts = [("history.svg", &page.history), ("prediction.svg", &page.prediction)];
    for (name, series) in charts {
        if let Some(series) = series {
            let chart_path = output_dir.join(name);
            render_line_chart(series, &chart_path)?;
            debug!("  - {}", chart_path.display());
        }
    }

    let io_time = io_start.elapsed();
    println!("All files took {:.2?}", io_time);
    println!("Wrote files to directory: {}", output_dir.display());

    let total_time = total_start.elapsed();
    debug!(
        "Performance breakdown: Render={:.1}%, IO={:.1}%",
        (render_time.as_secs_f64() / total_time.as_secs_f64()) * 100.0,
        (io_time.as_secs_f64() / total_time.as_secs_f64()) * 100.0
    );

    println!("\nTotal runtime: {:.2?}", total_time);
    Ok(())
}
