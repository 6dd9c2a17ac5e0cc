use crate::error::{PipelineError, Result};
use crate::structs::{ForecastRecord, MonthlyRecord, Variable};
use arrow_array::{ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::NaiveDate;
use csv::{Reader, Writer};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::{fs::File, path::Path, sync::Arc};

/// File name offered for the forecast download.
pub const FORECAST_FILE_NAME: &str = "climate_forecast.csv";
pub const FORECAST_MIME: &str = "text/csv; charset=utf-8";

const DATE_FORMAT: &str = "%Y-%m-%d";

fn optional(value: Option<&f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn forecast_to_writer<W: Write>(
    records: &[ForecastRecord],
    variables: &[Variable],
    writer: &mut Writer<W>,
) -> Result<()> {
    let mut header = vec!["year", "month", "date"];
    header.extend(variables.iter().map(|v| v.column()));
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.year.to_string(),
            record.month.to_string(),
            record.date.format(DATE_FORMAT).to_string(),
        ];
        row.extend(variables.iter().map(|v| optional(record.predictions.get(v))));
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes the forecast grid to a CSV file.
///
/// Columns are `year,month,date` followed by one column per variable. Values
/// are written at full precision so the file parses back to the same numbers.
///
/// # Arguments
/// * `records` - Forecast rows
/// * `variables` - Predicted columns to write, in order
/// * `output_path` - Path where the CSV file will be created
///
/// # Errors
/// Returns error if file cannot be created or written to.
pub fn write_forecast_csv(
    records: &[ForecastRecord],
    variables: &[Variable],
    output_path: &Path,
) -> Result<()> {
    let mut writer = Writer::from_writer(File::create(output_path)?);
    forecast_to_writer(records, variables, &mut writer)
}

/// Renders the forecast CSV in memory, for the download button.
pub fn forecast_csv_bytes(records: &[ForecastRecord], variables: &[Variable]) -> Result<Vec<u8>> {
    let mut writer = Writer::from_writer(Vec::new());
    forecast_to_writer(records, variables, &mut writer)?;
    writer
        .into_inner()
        .map_err(|e| PipelineError::Io(e.into_error()))
}

/// Parses a forecast CSV previously written by `write_forecast_csv`.
///
/// # Errors
/// Returns `PipelineError::Data` for unknown columns or malformed values.
pub fn read_forecast_csv(path: &Path) -> Result<Vec<ForecastRecord>> {
    let mut reader = Reader::from_reader(File::open(path)?);
    let headers = reader.headers()?.clone();
    if headers.len() < 3 {
        return Err(PipelineError::Data(
            "Forecast CSV needs year, month and date columns".to_string(),
        ));
    }
    let variables = headers
        .iter()
        .skip(3)
        .map(|name| {
            Variable::from_column(name)
                .ok_or_else(|| PipelineError::Data(format!("Unknown forecast column: {}", name)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let field = |i: usize| row.get(i).unwrap_or_default();
        let bad = |i: usize| PipelineError::Data(format!("Bad value '{}' in column {}", field(i), i));

        let year = field(0).parse::<i32>().map_err(|_| bad(0))?;
        let month = field(1).parse::<u32>().map_err(|_| bad(1))?;
        let date = NaiveDate::parse_from_str(field(2), DATE_FORMAT).map_err(|_| bad(2))?;

        let mut predictions = BTreeMap::new();
        for (offset, variable) in variables.iter().enumerate() {
            let idx = offset + 3;
            if field(idx).is_empty() {
                continue;
            }
            let value = field(idx).parse::<f64>().map_err(|_| bad(idx))?;
            predictions.insert(*variable, value);
        }

        records.push(ForecastRecord {
            year,
            month,
            date,
            predictions,
        });
    }
    Ok(records)
}

/// Writes the monthly aggregate table with formatted numeric values.
///
/// # Errors
/// Returns error if file cannot be created or written to.
pub fn write_monthly_csv(
    records: &[MonthlyRecord],
    variables: &[Variable],
    output_path: &Path,
) -> Result<()> {
    let mut writer = Writer::from_writer(File::create(output_path)?);

    let mut header = vec!["year", "month", "count"];
    header.extend(variables.iter().map(|v| v.column()));
    writer.write_record(&header)?;

    for record in records {
        let mut row = vec![
            record.year.to_string(),
            record.month.to_string(),
            record.count.to_string(),
        ];
        row.extend(
            variables
                .iter()
                .map(|v| record.values.get(v).map(|x| format!("{:.2}", x)).unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }

    writer.flush()?;
    Ok(())
}

/// Writes any serializable result to a pretty-formatted JSON file.
///
/// # Errors
/// Returns error if file cannot be created or serialization fails.
pub fn write_json<T: Serialize + ?Sized>(value: &T, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

/// Writes the forecast grid to a columnar Parquet file using Arrow format.
///
/// Variable columns are nullable; a row without a prediction for a variable
/// stores null.
///
/// # Errors
/// Returns error if file cannot be created, schema is invalid, or Arrow operations fail.
pub fn write_forecast_parquet(
    records: &[ForecastRecord],
    variables: &[Variable],
    output_path: &Path,
) -> Result<()> {
    let mut fields = vec![
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::UInt32, false),
        Field::new("date", DataType::Utf8, false),
    ];
    fields.extend(
        variables
            .iter()
            .map(|v| Field::new(v.column(), DataType::Float64, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let years: Int32Array = records.iter().map(|r| r.year).collect();
    let months: UInt32Array = records.iter().map(|r| r.month).collect();
    let dates = StringArray::from_iter_values(
        records
            .iter()
            .map(|r| r.date.format(DATE_FORMAT).to_string()),
    );

    let mut columns: Vec<ArrayRef> = vec![Arc::new(years), Arc::new(months), Arc::new(dates)];
    for variable in variables {
        let values: Float64Array = records
            .iter()
            .map(|r| r.predictions.get(variable).copied())
            .collect();
        columns.push(Arc::new(values));
    }

    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let file = File::create(output_path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}
