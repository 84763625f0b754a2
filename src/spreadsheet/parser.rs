//! File parsing and region detection for uploaded spreadsheets.
//!
//! Handles CSV and the first sheet of an XLSX workbook. Region
//! detection drops leading blank rows, locates the header row, and
//! fills in names for unnamed columns.

use calamine::{Data, Reader, Xlsx};
use std::io::Cursor;

use crate::error::{NeoBaseError, Result};

/// A parsed tabular file: header names plus string cell values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ParsedSheet {
    /// Returns true if the upload carried no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// File kinds the parser accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Csv,
    Xlsx,
}

impl FileKind {
    /// Guesses the kind from a file name.
    pub fn from_name(name: &str) -> Result<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".csv") || lower.ends_with(".tsv") || lower.ends_with(".txt") {
            Ok(Self::Csv)
        } else if lower.ends_with(".xlsx") || lower.ends_with(".xlsm") {
            Ok(Self::Xlsx)
        } else {
            Err(NeoBaseError::invalid_input(format!(
                "Unsupported file type '{name}'. Upload a CSV or XLSX file."
            )))
        }
    }
}

/// Parses an uploaded file into a sheet.
pub fn parse_file(name: &str, bytes: &[u8]) -> Result<ParsedSheet> {
    match FileKind::from_name(name)? {
        FileKind::Csv => parse_csv(bytes),
        FileKind::Xlsx => parse_xlsx(bytes),
    }
}

fn parse_csv(bytes: &[u8]) -> Result<ParsedSheet> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut grid: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| NeoBaseError::invalid_input(format!("Invalid CSV: {e}")))?;
        grid.push(record.iter().map(|s| s.to_string()).collect());
    }

    detect_region(grid)
}

fn parse_xlsx(bytes: &[u8]) -> Result<ParsedSheet> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook: Xlsx<_> = Xlsx::new(cursor)
        .map_err(|e| NeoBaseError::invalid_input(format!("Invalid XLSX file: {e}")))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| NeoBaseError::invalid_input("Workbook has no sheets"))?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| NeoBaseError::invalid_input(format!("Cannot read sheet: {e}")))?;

    let grid: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    detect_region(grid)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.to_string())
            .unwrap_or_else(|| dt.to_string()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("{e:?}"),
    }
}

/// Locates the header row and the data region below it.
///
/// Leading fully blank rows are dropped. The first non-blank row is
/// the header; blank header cells get positional names and duplicate
/// names get numeric suffixes.
fn detect_region(grid: Vec<Vec<String>>) -> Result<ParsedSheet> {
    let mut rows = grid
        .into_iter()
        .skip_while(|row| row.iter().all(|cell| cell.trim().is_empty()));

    let header_row = rows
        .next()
        .ok_or_else(|| NeoBaseError::invalid_input("The file is empty"))?;

    let headers = infer_header_names(&header_row);
    let width = headers.len();

    let data_rows: Vec<Vec<String>> = rows
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .map(|mut row| {
            // Ragged rows are padded or truncated to the header width.
            row.resize(width, String::new());
            row
        })
        .collect();

    Ok(ParsedSheet {
        headers,
        rows: data_rows,
    })
}

fn infer_header_names(header_row: &[String]) -> Vec<String> {
    let mut seen: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    header_row
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let base = if raw.trim().is_empty() {
                format!("column_{}", i + 1)
            } else {
                raw.trim().to_string()
            };
            let count = seen.entry(base.to_lowercase()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{base}_{count}")
            } else {
                base
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_simple_csv() {
        let csv = b"name,age\nAlice,36\nBob,29\n";
        let sheet = parse_file("people.csv", csv).unwrap();
        assert_eq!(sheet.headers, vec!["name", "age"]);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[0], vec!["Alice", "36"]);
    }

    #[test]
    fn test_leading_blank_rows_dropped() {
        let csv = b",,\n,,\nname,age,city\nAlice,36,Berlin\n";
        let sheet = parse_file("people.csv", csv).unwrap();
        assert_eq!(sheet.headers, vec!["name", "age", "city"]);
        assert_eq!(sheet.rows.len(), 1);
    }

    #[test]
    fn test_blank_and_duplicate_headers_get_names() {
        let csv = b"name,,name\nAlice,x,y\n";
        let sheet = parse_file("f.csv", csv).unwrap();
        assert_eq!(sheet.headers, vec!["name", "column_2", "name_2"]);
    }

    #[test]
    fn test_ragged_rows_are_padded() {
        let csv = b"a,b,c\n1,2\n1,2,3,4\n";
        let sheet = parse_file("f.csv", csv).unwrap();
        assert_eq!(sheet.rows[0], vec!["1", "2", ""]);
        assert_eq!(sheet.rows[1], vec!["1", "2", "3"]);
    }

    #[test]
    fn test_blank_data_rows_skipped() {
        let csv = b"a,b\n1,2\n,\n3,4\n";
        let sheet = parse_file("f.csv", csv).unwrap();
        assert_eq!(sheet.rows.len(), 2);
    }

    #[test]
    fn test_empty_file_rejected() {
        let err = parse_file("f.csv", b"").unwrap_err();
        assert_eq!(err.code(), "INPUT_INVALID");
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = parse_file("f.parquet", b"whatever").unwrap_err();
        assert_eq!(err.code(), "INPUT_INVALID");
    }

    #[test]
    fn test_empty_upload_is_parsable_but_empty() {
        let csv = b"name,age\n";
        let sheet = parse_file("f.csv", csv).unwrap();
        assert!(sheet.is_empty());
    }
}
