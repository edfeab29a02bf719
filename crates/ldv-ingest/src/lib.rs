//! Input-file normalization: encoding fallback, chunked CSV parsing,
//! reindexing to the fixed column set.

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord};
use ldv_core::{ColumnSchema, Record, TextEncoding};
use thiserror::Error;

pub const CRATE_NAME: &str = "ldv-ingest";

/// Recoverable per-file failures. The pipeline logs these, excludes the
/// file from the merge, and leaves it on disk.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Zero bytes, or a header with no data rows. The file is skipped and
    /// not consumed.
    #[error("file has no rows")]
    EmptyInput,
    #[error("reading input failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("malformed csv: {0}")]
    Malformed(#[from] csv::Error),
}

/// One successfully normalized input file.
#[derive(Debug, Clone)]
pub struct NormalizedFile {
    pub file_name: String,
    pub encoding: TextEncoding,
    pub records: Vec<Record>,
}

/// Decode input bytes, attempting UTF-8 first and falling back to Latin-1.
///
/// The fallback is total: every byte sequence is valid Latin-1, so a file
/// that is not UTF-8 still decodes, with each byte mapped to the
/// corresponding code point.
pub fn decode_text(bytes: &[u8]) -> (Cow<'_, str>, TextEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), TextEncoding::Utf8),
        Err(_) => (encoding_rs::mem::decode_latin1(bytes), TextEncoding::Latin1),
    }
}

/// Normalize one input file into records aligned with the output schema.
///
/// Every field is kept as text and trimmed; unknown columns are dropped and
/// missing expected columns become empty strings. Each record's final value
/// is the originating file name (the synthetic source column). Rows are
/// parsed in batches of `chunk_size` to bound the transient per-file
/// footprint. Pure transform: reads the file once, writes nothing.
pub fn normalize_file(
    path: &Path,
    schema: &ColumnSchema,
    chunk_size: usize,
) -> Result<NormalizedFile, IngestError> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Err(IngestError::EmptyInput);
    }

    let (text, encoding) = decode_text(&bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut reader = ReaderBuilder::new().flexible(true).from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();
    let header_index: Vec<Option<usize>> = schema
        .expected()
        .iter()
        .map(|column| headers.iter().position(|h| h.trim() == column.as_str()))
        .collect();

    let chunk_size = chunk_size.max(1);
    let mut records = Vec::new();
    let mut batch: Vec<StringRecord> = Vec::new();
    for row in reader.records() {
        batch.push(row?);
        if batch.len() >= chunk_size {
            normalize_batch(&mut records, &batch, &header_index, &file_name);
            batch.clear();
        }
    }
    normalize_batch(&mut records, &batch, &header_index, &file_name);

    if records.is_empty() {
        return Err(IngestError::EmptyInput);
    }

    Ok(NormalizedFile {
        file_name,
        encoding,
        records,
    })
}

fn normalize_batch(
    records: &mut Vec<Record>,
    batch: &[StringRecord],
    header_index: &[Option<usize>],
    file_name: &str,
) {
    for row in batch {
        let mut values = Vec::with_capacity(header_index.len() + 1);
        for index in header_index.iter().copied() {
            let value = index
                .and_then(|i| row.get(i))
                .map(|v| v.trim().to_string())
                .unwrap_or_default();
            values.push(value);
        }
        values.push(file_name.to_string());
        records.push(Record::new(values));
    }
}
