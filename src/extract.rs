use crate::error::{PipelineError, Result};
use crate::structs::{Dataset, LoadOptions, Observation, Variable, VariableValues};
use calamine::{Data, Reader, open_workbook_auto};
use chrono::{Datelike, Days, NaiveDate};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Day-first layouts seen in station exports, with ISO as a last resort.
const DATE_FORMATS: [&str; 4] = ["%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d"];

/// Headers accepted for the date column (compared case-insensitively).
const DATE_COLUMNS: [&str; 2] = ["tanggal", "date"];

/// Alternate headers some exports use for the average wind speed column.
const WIND_SPEED_ALIASES: [&str; 2] = ["ff_rata2", "FF_AVG"];

/// Station codes for "not measured" and "no data".
const SENTINELS: [f64; 2] = [8888.0, 9999.0];

/// A single cell as read from the source, before any typing.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Number(f64),
    Text(String),
    Date(NaiveDate),
}

/// Header row plus untyped body rows of one worksheet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

/// Reads a table from either a spreadsheet or a CSV export, chosen by extension.
///
/// # Arguments
/// * `path` - Source file (`.xlsx`, `.xlsm`, `.xls`, `.ods` or `.csv`)
/// * `sheet` - Worksheet name; ignored for CSV input
///
/// # Errors
/// Returns error if the file cannot be opened or the worksheet does not exist.
pub fn read_table(path: &Path, sheet: &str) -> Result<RawTable> {
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
    if is_csv {
        read_csv_table(path)
    } else {
        read_spreadsheet(path, sheet)
    }
}

/// Reads one worksheet of a workbook. The first row is taken as the header.
pub fn read_spreadsheet(path: &Path, sheet: &str) -> Result<RawTable> {
    debug!("Opening workbook {} (sheet '{}')", path.display(), sheet);
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook.worksheet_range(sheet)?;

    let mut rows = range.rows();
    let headers = match rows.next() {
        Some(header) => header.iter().map(header_text).collect(),
        None => return Ok(RawTable::default()),
    };
    let rows = rows
        .map(|row| row.iter().map(convert_cell).collect())
        .collect();

    Ok(RawTable { headers, rows })
}

/// Reads a CSV export of the daily sheet.
pub fn read_csv_table(path: &Path) -> Result<RawTable> {
    debug!("Reading CSV table {}", path.display());
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(File::open(path)?);

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(text_cell).collect());
    }

    Ok(RawTable { headers, rows })
}

fn header_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => f.to_string(),
        _ => String::new(),
    }
}

fn convert_cell(cell: &Data) -> Cell {
    match cell {
        Data::Empty | Data::Error(_) => Cell::Empty,
        Data::Int(i) => Cell::Number(*i as f64),
        Data::Float(f) => Cell::Number(*f),
        Data::Bool(b) => Cell::Text(b.to_string()),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => text_cell(s),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(Cell::Date)
            .unwrap_or(Cell::Empty),
    }
}

fn text_cell(raw: &str) -> Cell {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Cell::Empty
    } else if let Ok(value) = trimmed.parse::<f64>() {
        Cell::Number(value)
    } else {
        Cell::Text(trimmed.to_string())
    }
}

/// Converts an Excel serial day number (1900 date system) to a calendar date.
fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(serial.floor() as u64))
}

/// Parses a date cell with the day-first convention.
///
/// Text may carry a trailing time component, which is ignored. Numbers are
/// treated as spreadsheet serial days.
pub fn parse_date(cell: &Cell) -> Option<NaiveDate> {
    match cell {
        Cell::Date(date) => Some(*date),
        Cell::Number(serial) => excel_serial_to_date(*serial),
        Cell::Text(text) => {
            let day = text.split_whitespace().next()?;
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(day, fmt).ok())
        }
        Cell::Empty => None,
    }
}

/// Drops non-finite readings, and station sentinel codes when asked to.
fn clean_value(value: f64, options: &LoadOptions) -> Option<f64> {
    if !value.is_finite() || (options.clean_sentinels && SENTINELS.contains(&value)) {
        return None;
    }
    Some(value)
}

/// Turns a raw sheet into typed daily observations.
///
/// Duplicate headers keep their first occurrence, the wind speed alias is
/// renamed to `ff_avg` when that column is missing, and the date column is
/// parsed day-first with year and month derived from it.
///
/// # Arguments
/// * `raw` - Header and body rows as read from the source
/// * `options` - Value cleaning switches
///
/// # Returns
/// Returns a `Dataset` whose `variables` lists the climate columns present,
/// in vocabulary order.
///
/// # Errors
/// Returns `PipelineError::Data` if there is no date column and
/// `PipelineError::Date` for the first date cell that cannot be parsed.
pub fn build_dataset(raw: &RawTable, options: &LoadOptions) -> Result<Dataset> {
    let mut seen = HashSet::new();
    let mut columns: Vec<(usize, String)> = Vec::new();
    for (idx, name) in raw.headers.iter().enumerate() {
        let name = name.trim();
        if seen.insert(name.to_string()) {
            columns.push((idx, name.to_string()));
        } else {
            debug!("Dropping duplicate column '{}' at position {}", name, idx);
        }
    }

    let canonical = Variable::WindSpeed.column();
    if !columns.iter().any(|(_, name)| name == canonical) {
        let alias = columns
            .iter_mut()
            .find(|(_, name)| WIND_SPEED_ALIASES.contains(&name.as_str()));
        if let Some((_, name)) = alias {
            debug!("Renaming column '{}' to '{}'", name, canonical);
            *name = canonical.to_string();
        }
    }

    let date_idx = columns
        .iter()
        .find(|(_, name)| DATE_COLUMNS.contains(&name.to_lowercase().as_str()))
        .map(|(idx, _)| *idx)
        .ok_or_else(|| PipelineError::Data("Date column not found".to_string()))?;

    let mut variable_columns: Vec<(Variable, usize)> = columns
        .iter()
        .filter_map(|(idx, name)| Variable::from_column(name).map(|v| (v, *idx)))
        .collect();
    variable_columns.sort_by_key(|(v, _)| *v);

    let mut observations = Vec::with_capacity(raw.rows.len());
    let mut skipped = 0;
    for (row_idx, row) in raw.rows.iter().enumerate() {
        let date_cell = match row.get(date_idx) {
            Some(cell) if *cell != Cell::Empty => cell,
            _ => {
                skipped += 1;
                continue;
            }
        };
        let date = parse_date(date_cell).ok_or_else(|| PipelineError::Date {
            // header is row 1 in the source
            row: row_idx + 2,
            value: cell_display(date_cell),
        })?;

        let mut values: VariableValues = [None; Variable::COUNT];
        for (variable, idx) in &variable_columns {
            if let Some(Cell::Number(v)) = row.get(*idx) {
                values[variable.index()] = clean_value(*v, options);
            }
        }

        observations.push(Observation {
            date,
            year: date.year(),
            month: date.month(),
            values,
        });
    }

    if skipped > 0 {
        warn!("Skipped {} rows without a date", skipped);
    }
    info!(
        "Loaded {} daily observations with {} climate variables",
        observations.len(),
        variable_columns.len()
    );

    Ok(Dataset {
        observations,
        variables: variable_columns.into_iter().map(|(v, _)| v).collect(),
    })
}

fn cell_display(cell: &Cell) -> String {
    match cell {
        Cell::Empty => String::new(),
        Cell::Number(n) => n.to_string(),
        Cell::Text(t) => t.clone(),
        Cell::Date(d) => d.to_string(),
    }
}

/// Reads and types a dataset in one step.
pub fn load_dataset(path: &Path, sheet: &str, options: &LoadOptions) -> Result<Dataset> {
    let raw = read_table(path, sheet)?;
    build_dataset(&raw, options)
}

struct CacheEntry {
    path: PathBuf,
    sheet: String,
    options: LoadOptions,
    modified: SystemTime,
    dataset: Arc<Dataset>,
}

/// Holds the most recently loaded dataset, keyed on source path, sheet name,
/// load options and file modification time. A changed key forces a reload.
#[derive(Default)]
pub struct DatasetCache {
    entry: Option<CacheEntry>,
    loads: usize,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached dataset, loading it first if the source changed.
    ///
    /// # Errors
    /// Returns error if the file metadata cannot be read or the load fails.
    pub fn get_or_load(
        &mut self,
        path: &Path,
        sheet: &str,
        options: &LoadOptions,
    ) -> Result<Arc<Dataset>> {
        let modified = std::fs::metadata(path)?.modified()?;
        if let Some(entry) = &self.entry {
            if entry.path == path
                && entry.sheet == sheet
                && entry.options == *options
                && entry.modified == modified
            {
                debug!("Dataset cache hit for {}", path.display());
                return Ok(Arc::clone(&entry.dataset));
            }
        }

        debug!("Dataset cache miss for {}", path.display());
        let dataset = Arc::new(load_dataset(path, sheet, options)?);
        self.loads += 1;
        self.entry = Some(CacheEntry {
            path: path.to_path_buf(),
            sheet: sheet.to_string(),
            options: *options,
            modified,
            dataset: Arc::clone(&dataset),
        });
        Ok(dataset)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Number of times the source has actually been read.
    pub fn loads(&self) -> usize {
        self.loads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{ExcelDateTime, Format, Workbook, XlsxError};
    use std::io::Write;
    use std::time::Duration;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn table(headers: &[&str], rows: Vec<Vec<Cell>>) -> RawTable {
        RawTable {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn parses_day_first_dates() {
        let expected = NaiveDate::from_ymd_opt(2021, 3, 4).unwrap();
        assert_eq!(parse_date(&text("04-03-2021")), Some(expected));
        assert_eq!(parse_date(&text("04/03/2021")), Some(expected));
        assert_eq!(parse_date(&text("04.03.2021 00:00:00")), Some(expected));
        assert_eq!(parse_date(&text("2021-03-04")), Some(expected));
        assert_eq!(parse_date(&text("yesterday")), None);
    }

    #[test]
    fn parses_spreadsheet_serial_days() {
        // 44197 is 2021-01-01 in the 1900 date system
        assert_eq!(
            parse_date(&Cell::Number(44197.0)),
            NaiveDate::from_ymd_opt(2021, 1, 1)
        );
    }

    #[test]
    fn derives_year_and_month_from_date() {
        let raw = table(
            &["Tanggal", "Tavg"],
            vec![
                vec![text("31-12-2019"), Cell::Number(27.5)],
                vec![text("01-01-2020"), Cell::Number(26.0)],
            ],
        );
        let dataset = build_dataset(&raw, &LoadOptions::default()).unwrap();
        for obs in &dataset.observations {
            assert_eq!(obs.year, obs.date.year());
            assert_eq!(obs.month, obs.date.month());
        }
        assert_eq!(dataset.observations[0].year, 2019);
        assert_eq!(dataset.observations[0].month, 12);
        assert_eq!(dataset.variables, vec![Variable::AvgTemp]);
    }

    #[test]
    fn duplicate_columns_keep_first_occurrence() {
        let raw = table(
            &["Tanggal", "RR", "RR"],
            vec![vec![text("01-01-2020"), Cell::Number(3.0), Cell::Number(99.0)]],
        );
        let dataset = build_dataset(&raw, &LoadOptions::default()).unwrap();
        assert_eq!(dataset.variables, vec![Variable::Precipitation]);
        assert_eq!(
            dataset.observations[0].value(Variable::Precipitation),
            Some(3.0)
        );
    }

    #[test]
    fn renames_wind_speed_alias() {
        let raw = table(
            &["Tanggal", "ff_rata2"],
            vec![vec![text("01-01-2020"), Cell::Number(2.5)]],
        );
        let dataset = build_dataset(&raw, &LoadOptions::default()).unwrap();
        assert_eq!(dataset.variables, vec![Variable::WindSpeed]);
        assert_eq!(dataset.observations[0].value(Variable::WindSpeed), Some(2.5));
    }

    #[test]
    fn alias_is_ignored_when_canonical_column_exists() {
        let raw = table(
            &["Tanggal", "ff_avg", "ff_rata2"],
            vec![vec![text("01-01-2020"), Cell::Number(1.0), Cell::Number(7.0)]],
        );
        let dataset = build_dataset(&raw, &LoadOptions::default()).unwrap();
        assert_eq!(dataset.observations[0].value(Variable::WindSpeed), Some(1.0));
    }

    #[test]
    fn bad_date_fails_whole_load() {
        let raw = table(
            &["Tanggal", "Tn"],
            vec![
                vec![text("01-01-2020"), Cell::Number(24.0)],
                vec![text("32-13-2020"), Cell::Number(24.0)],
            ],
        );
        match build_dataset(&raw, &LoadOptions::default()) {
            Err(PipelineError::Date { row, value }) => {
                assert_eq!(row, 3);
                assert_eq!(value, "32-13-2020");
            }
            other => panic!("expected date error, got {:?}", other),
        }
    }

    #[test]
    fn missing_date_column_is_an_error() {
        let raw = table(&["Tn"], vec![vec![Cell::Number(24.0)]]);
        assert!(matches!(build_dataset(&raw, &LoadOptions::default()), Err(PipelineError::Data(_))));
    }

    fn sentinel_row() -> RawTable {
        table(
            &["Tanggal", "RR", "ss", "RH_avg"],
            vec![vec![
                text("01-01-2020"),
                Cell::Number(8888.0),
                Cell::Number(9999.0),
                text("-"),
            ]],
        )
    }

    #[test]
    fn sentinels_are_kept_by_default() {
        let dataset = build_dataset(&sentinel_row(), &LoadOptions::default()).unwrap();
        let obs = &dataset.observations[0];
        assert_eq!(obs.value(Variable::Precipitation), Some(8888.0));
        assert_eq!(obs.value(Variable::Sunshine), Some(9999.0));
        assert_eq!(obs.value(Variable::Humidity), None);
    }

    #[test]
    fn sentinels_and_text_become_missing_when_cleaning() {
        let options = LoadOptions {
            clean_sentinels: true,
        };
        let dataset = build_dataset(&sentinel_row(), &options).unwrap();
        assert_eq!(dataset.observations[0].values, [None; Variable::COUNT]);
    }

    #[test]
    fn rows_without_date_are_skipped() {
        let raw = table(
            &["Tanggal", "Tn"],
            vec![
                vec![text("01-01-2020"), Cell::Number(24.0)],
                vec![Cell::Empty, Cell::Empty],
            ],
        );
        assert_eq!(build_dataset(&raw, &LoadOptions::default()).unwrap().observations.len(), 1);
    }

    fn write_csv(path: &Path, body: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn reads_csv_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.csv");
        write_csv(&path, "Tanggal,Tn,Tx\n01-01-2020,24.1,31.0\n02-01-2020,,30.5\n");

        let dataset = load_dataset(&path, "ignored", &LoadOptions::default()).unwrap();
        assert_eq!(dataset.observations.len(), 2);
        assert_eq!(dataset.variables, vec![Variable::MinTemp, Variable::MaxTemp]);
        assert_eq!(dataset.observations[1].value(Variable::MinTemp), None);
        assert_eq!(dataset.observations[1].value(Variable::MaxTemp), Some(30.5));
    }

    #[test]
    fn cache_reloads_only_when_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily.csv");
        write_csv(&path, "Tanggal,Tn\n01-01-2020,24.1\n");

        let mut cache = DatasetCache::new();
        let first = cache.get_or_load(&path, "sheet", &LoadOptions::default()).unwrap();
        let second = cache.get_or_load(&path, "sheet", &LoadOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.loads(), 1);

        write_csv(&path, "Tanggal,Tn\n01-01-2020,24.1\n02-01-2020,25.0\n");
        let later = SystemTime::now() + Duration::from_secs(10);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let third = cache.get_or_load(&path, "sheet", &LoadOptions::default()).unwrap();
        assert_eq!(cache.loads(), 2);
        assert_eq!(third.observations.len(), 2);

        cache.invalidate();
        cache.get_or_load(&path, "sheet", &LoadOptions::default()).unwrap();
        assert_eq!(cache.loads(), 3);

        let cleaning = LoadOptions {
            clean_sentinels: true,
        };
        cache.get_or_load(&path, "sheet", &cleaning).unwrap();
        assert_eq!(cache.loads(), 4);
    }

    /// Daily sheet with a native date cell, a text date, a duplicate `RR`
    /// header and a trailing row without a date.
    fn write_workbook(path: &Path) -> std::result::Result<(), XlsxError> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Data Harian - Table")?;
        for (col, header) in ["Tanggal", "Tn", "RR", "RR", "ff_rata2"].iter().enumerate() {
            sheet.write_string(0, col as u16, *header)?;
        }

        let date_format = Format::new().set_num_format("dd-mm-yyyy");
        let first = ExcelDateTime::from_ymd(2020, 1, 14)?;
        sheet.write_datetime_with_format(1, 0, &first, &date_format)?;
        sheet.write_number(1, 1, 24.5)?;
        sheet.write_number(1, 2, 3.0)?;
        sheet.write_number(1, 3, 99.0)?;
        sheet.write_number(1, 4, 2.1)?;

        sheet.write_string(2, 0, "15/01/2020")?;
        sheet.write_number(2, 1, 25.0)?;
        sheet.write_string(2, 2, "-")?;
        sheet.write_number(2, 3, 98.0)?;
        sheet.write_number(2, 4, 1.9)?;

        sheet.write_number(3, 1, 23.0)?;
        workbook.save(path)
    }

    #[test]
    fn reads_xlsx_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Data.xlsx");
        write_workbook(&path).unwrap();

        let raw = read_table(&path, "Data Harian - Table").unwrap();
        assert_eq!(raw.headers, vec!["Tanggal", "Tn", "RR", "RR", "ff_rata2"]);
        assert_eq!(
            raw.rows[0][0],
            Cell::Date(NaiveDate::from_ymd_opt(2020, 1, 14).unwrap())
        );

        let dataset = load_dataset(&path, "Data Harian - Table", &LoadOptions::default()).unwrap();
        assert_eq!(
            dataset.variables,
            vec![Variable::MinTemp, Variable::Precipitation, Variable::WindSpeed]
        );
        assert_eq!(dataset.observations.len(), 2);

        let first = &dataset.observations[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2020, 1, 14).unwrap());
        assert_eq!((first.year, first.month), (2020, 1));
        assert_eq!(first.value(Variable::Precipitation), Some(3.0));
        assert_eq!(first.value(Variable::WindSpeed), Some(2.1));

        let second = &dataset.observations[1];
        assert_eq!(second.date, NaiveDate::from_ymd_opt(2020, 1, 15).unwrap());
        assert_eq!(second.value(Variable::MinTemp), Some(25.0));
        assert_eq!(second.value(Variable::Precipitation), None);
    }

    #[test]
    fn missing_worksheet_is_a_spreadsheet_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Data.xlsx");
        write_workbook(&path).unwrap();

        let result = load_dataset(&path, "Data Bulanan", &LoadOptions::default());
        assert!(matches!(result, Err(PipelineError::Spreadsheet(_))));
    }
}
