//! Score sheet reading: XLSX (first worksheet) or UTF-8 CSV into rows keyed
//! by header text. Cells keep their left-to-right header order.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type SheetRow = IndexMap<String, String>;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("workbook could not be opened: {0}")]
    Workbook(String),
    #[error("workbook has no worksheets")]
    NoWorksheet,
    #[error("file is neither an xlsx workbook nor UTF-8 text")]
    NotText,
    #[error("csv could not be parsed: {0}")]
    Csv(#[from] csv::Error),
    #[error("rows must be an array of objects")]
    BadRows,
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

pub fn read_rows(path: &Path) -> Result<Vec<SheetRow>, SheetError> {
    let bytes = std::fs::read(path).map_err(|source| SheetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.starts_with(ZIP_MAGIC) {
        read_xlsx(path)
    } else {
        read_csv(&bytes)
    }
}

fn read_xlsx(path: &Path) -> Result<Vec<SheetRow>, SheetError> {
    let book = umya_spreadsheet::reader::xlsx::read(path)
        .map_err(|e| SheetError::Workbook(e.to_string()))?;
    let sheet = book
        .get_sheet_collection()
        .first()
        .ok_or(SheetError::NoWorksheet)?;
    let (max_col, max_row) = sheet.get_highest_column_and_row();

    let cell_text = |col: u32, row: u32| -> String {
        sheet
            .get_cell((col, row))
            .map(|c| c.get_value().trim().to_string())
            .unwrap_or_default()
    };

    let headers: Vec<(u32, String)> = (1..=max_col)
        .map(|col| (col, cell_text(col, 1)))
        .filter(|(_, h)| !h.is_empty())
        .collect();

    let mut rows = Vec::new();
    for row in 2..=max_row {
        let record: SheetRow = headers
            .iter()
            .map(|(col, h)| (h.clone(), cell_text(*col, row)))
            .filter(|(_, v)| !v.is_empty())
            .collect();
        if !record.is_empty() {
            rows.push(record);
        }
    }
    Ok(rows)
}

fn read_csv(bytes: &[u8]) -> Result<Vec<SheetRow>, SheetError> {
    let text = std::str::from_utf8(bytes).map_err(|_| SheetError::NotText)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: SheetRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(h, v)| !h.is_empty() && !v.is_empty())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Rows passed inline as JSON objects, in the order the keys were written.
/// Numbers keep their JSON text form.
pub fn rows_from_json(value: &serde_json::Value) -> Result<Vec<SheetRow>, SheetError> {
    let arr = value.as_array().ok_or(SheetError::BadRows)?;
    let mut rows = Vec::with_capacity(arr.len());
    for item in arr {
        let obj = item.as_object().ok_or(SheetError::BadRows)?;
        let row: SheetRow = obj
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    serde_json::Value::String(s) => s.trim().to_string(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                (!text.is_empty()).then(|| (k.clone(), text))
            })
            .collect();
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}
