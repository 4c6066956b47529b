//! CSV reader: validates the header against the compiled schema and coerces every row.
//!
//! Parsing is pure. It reads the file and returns records or a [`ParseError`]; it never
//! touches the ledger or the store.

use std::path::Path;

use crate::config::{BadRowPolicy, ParserConfig};
use crate::error::ParseError;

use super::record::{NormalizedRecord, Provenance};
use super::schema::{canonical_name, CompiledSchema, Value};

/// Outcome of a successful parse
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub records: Vec<NormalizedRecord>,
    /// Rows dropped under [`BadRowPolicy::Skip`]
    pub skipped: Vec<ParseError>,
}

impl ParsedFile {
    pub fn row_count(&self) -> usize {
        self.records.len()
    }
}

/// Where a field of the output record is read from
#[derive(Debug, Clone, Copy)]
enum FieldSource {
    Declared { column: usize, header: usize },
    Extra { header: usize },
    Absent { column: usize },
}

/// Stat `path` and reject it when it exceeds the configured limit. Returns the size.
pub fn check_size(path: &Path, config: &ParserConfig) -> Result<u64, ParseError> {
    let size = std::fs::metadata(path)
        .map_err(|e| ParseError::Unreadable { reason: e.to_string() })?
        .len();
    if size > config.max_file_size_bytes {
        return Err(ParseError::Oversized {
            size,
            limit: config.max_file_size_bytes,
        });
    }
    Ok(size)
}

/// Read a whole file after the size check.
pub fn read_bounded(path: &Path, config: &ParserConfig) -> Result<Vec<u8>, ParseError> {
    check_size(path, config)?;
    std::fs::read(path).map_err(|e| ParseError::Unreadable { reason: e.to_string() })
}

/// Read and validate a whole file.
pub fn parse(path: &Path, schema: &CompiledSchema, config: &ParserConfig) -> Result<ParsedFile, ParseError> {
    let content = read_bounded(path, config)?;
    parse_bytes(&content, path, schema, config)
}

/// Parse an in-memory file body. `source` is recorded as provenance.
pub fn parse_bytes(
    content: &[u8],
    source: &Path,
    schema: &CompiledSchema,
    config: &ParserConfig,
) -> Result<ParsedFile, ParseError> {
    // The file may have grown between stat and read
    if content.len() as u64 > config.max_file_size_bytes {
        return Err(ParseError::Oversized {
            size: content.len() as u64,
            limit: config.max_file_size_bytes,
        });
    }
    if content.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ParseError::Unreadable {
            reason: format!("invalid header: {}", e),
        })?
        .iter()
        .map(canonical_name)
        .collect();

    let plan = build_plan(&headers, schema, config.allow_extra_columns)?;

    let mut records = Vec::new();
    let mut skipped = Vec::new();

    for (idx, result) in reader.records().enumerate() {
        let row = idx + 1;
        let outcome = match result {
            Ok(raw) => coerce_row(&raw, row, &headers, &plan, schema, source),
            Err(e) => Err(ParseError::MalformedRow {
                row,
                column: String::new(),
                reason: e.to_string(),
            }),
        };

        match outcome {
            Ok(record) => records.push(record),
            Err(err) => match config.on_bad_row {
                BadRowPolicy::Abort => return Err(err),
                BadRowPolicy::Skip => {
                    log::warn!("{}: skipping {}", source.display(), err);
                    skipped.push(err);
                }
            },
        }
    }

    if records.is_empty() {
        return Err(ParseError::Empty);
    }

    Ok(ParsedFile { records, skipped })
}

fn build_plan(headers: &[String], schema: &CompiledSchema, allow_extra: bool) -> Result<Vec<FieldSource>, ParseError> {
    let missing: Vec<String> = schema
        .required_columns()
        .filter(|c| !headers.contains(&c.name))
        .map(|c| c.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ParseError::SchemaMismatch { missing });
    }

    let mut plan = Vec::with_capacity(headers.len());
    for (header_idx, name) in headers.iter().enumerate() {
        // First occurrence wins when a header repeats
        if headers[..header_idx].contains(name) || name.is_empty() {
            continue;
        }
        match schema.columns.iter().position(|c| &c.name == name) {
            Some(column) => plan.push(FieldSource::Declared {
                column,
                header: header_idx,
            }),
            None if allow_extra => plan.push(FieldSource::Extra { header: header_idx }),
            None => {}
        }
    }
    for (column, col) in schema.columns.iter().enumerate() {
        if !headers.contains(&col.name) {
            plan.push(FieldSource::Absent { column });
        }
    }
    Ok(plan)
}

fn coerce_row(
    raw: &csv::StringRecord,
    row: usize,
    headers: &[String],
    plan: &[FieldSource],
    schema: &CompiledSchema,
    source: &Path,
) -> Result<NormalizedRecord, ParseError> {
    if raw.len() != headers.len() {
        return Err(ParseError::MalformedRow {
            row,
            column: String::new(),
            reason: format!("expected {} fields, found {}", headers.len(), raw.len()),
        });
    }

    let mut fields = Vec::with_capacity(plan.len());
    for source_field in plan {
        match *source_field {
            FieldSource::Declared { column, header } => {
                let col = &schema.columns[column];
                let cell = raw.get(header).unwrap_or("");
                let value = col.coerce_cell(cell).map_err(|reason| ParseError::MalformedRow {
                    row,
                    column: col.name.clone(),
                    reason,
                })?;
                fields.push((col.name.clone(), value));
            }
            FieldSource::Extra { header } => {
                let cell = raw.get(header).unwrap_or("").trim();
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                fields.push((headers[header].clone(), value));
            }
            FieldSource::Absent { column } => {
                fields.push((schema.columns[column].name.clone(), Value::Null));
            }
        }
    }

    Ok(NormalizedRecord::new(
        fields,
        Provenance {
            source_file: source.to_path_buf(),
            row_index: row,
        },
    ))
}
