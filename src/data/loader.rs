use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Float32Array, Float64Array, Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field as ArrowField, Schema};
use arrow::record_batch::RecordBatch;
use ndarray::{Array2, ArrayD, IxDyn};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

use super::model::Field;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load the fields stored in a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.json`    – `{ "name", "shape", "values" }` or an array of them (any rank)
/// * `.csv`     – one row per time step, one column per channel
/// * `.parquet` – one row per time step, one numeric column per channel
///
/// Missing values are `null` (JSON, Parquet), empty or `NaN` (CSV).
pub fn load_file(path: &Path) -> Result<Vec<Field>> {
    match extension(path).as_str() {
        "json" => load_json(path),
        "csv" => Ok(vec![load_csv(path)?]),
        "parquet" | "pq" => Ok(vec![load_parquet(path)?]),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

/// Write a field in the format given by the extension of `path`.
///
/// CSV and Parquet flatten the spatial axes into channels.
pub fn save_file(path: &Path, field: &Field) -> Result<()> {
    match extension(path).as_str() {
        "json" => save_json(path, std::slice::from_ref(field)),
        "csv" => save_csv(path, field),
        "parquet" | "pq" => save_parquet(path, field),
        other => bail!("Unsupported file extension: .{other}"),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("field")
        .to_string()
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// JSON form of a field, values flattened in row-major order:
///
/// ```json
/// { "name": "sst", "shape": [120, 4, 5], "values": [12.1, null, ...] }
/// ```
#[derive(Debug, Serialize, Deserialize)]
struct FieldRecord {
    #[serde(default)]
    name: Option<String>,
    shape: Vec<usize>,
    values: Vec<Option<f64>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FieldRecords {
    One(FieldRecord),
    Many(Vec<FieldRecord>),
}

fn load_json(path: &Path) -> Result<Vec<Field>> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    let records: FieldRecords = serde_json::from_str(&text).context("parsing JSON")?;
    let records = match records {
        FieldRecords::One(r) => vec![r],
        FieldRecords::Many(rs) => rs,
    };
    if records.is_empty() {
        bail!("{} holds no field", path.display());
    }

    records
        .into_iter()
        .enumerate()
        .map(|(i, rec)| {
            let name = rec.name.unwrap_or_else(|| format!("{}{i}", stem(path)));
            let expected: usize = rec.shape.iter().product();
            if expected != rec.values.len() {
                bail!(
                    "Field '{name}': shape {:?} needs {expected} values, got {}",
                    rec.shape,
                    rec.values.len()
                );
            }
            let flat: Vec<f64> = rec.values.iter().map(|v| v.unwrap_or(f64::NAN)).collect();
            let values = ArrayD::from_shape_vec(IxDyn(&rec.shape), flat)
                .with_context(|| format!("Field '{name}': bad shape"))?;
            Field::new(name.clone(), values).with_context(|| format!("Field '{name}'"))
        })
        .collect()
}

pub fn save_json(path: &Path, fields: &[Field]) -> Result<()> {
    let records: Vec<FieldRecord> = fields
        .iter()
        .map(|f| FieldRecord {
            name: Some(f.name.clone()),
            shape: f.shape().to_vec(),
            values: f
                .values()
                .iter()
                .zip(f.mask().iter())
                .map(|(&v, &m)| (!m).then_some(v))
                .collect(),
        })
        .collect();
    let text = if records.len() == 1 {
        serde_json::to_string_pretty(&records[0])
    } else {
        serde_json::to_string_pretty(&records)
    }
    .context("serializing fields")?;
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// CSV layout: header row with channel names, then one row per time step.
fn load_csv(path: &Path) -> Result<Field> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let n_channels = reader.headers().context("reading CSV headers")?.len();
    if n_channels == 0 {
        bail!("CSV has no column");
    }

    let mut flat = Vec::new();
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        if record.len() != n_channels {
            bail!("CSV row {row_no}: {} values for {n_channels} columns", record.len());
        }
        for (col, tok) in record.iter().enumerate() {
            flat.push(parse_value(tok).with_context(|| format!("CSV row {row_no}, column {col}"))?);
        }
    }
    let n_times = flat.len() / n_channels;
    let values = Array2::from_shape_vec((n_times, n_channels), flat).context("CSV shape")?;
    Field::from_series(stem(path), values).context("building field from CSV")
}

fn parse_value(tok: &str) -> Result<f64> {
    let tok = tok.trim();
    if tok.is_empty() || tok.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    tok.parse::<f64>()
        .with_context(|| format!("'{tok}' is not a number"))
}

fn save_csv(path: &Path, field: &Field) -> Result<()> {
    let matrix = field.to_matrix();
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;
    writer
        .write_record(channel_names(matrix.ncols()))
        .context("writing CSV header")?;
    for row in matrix.rows() {
        writer
            .write_record(row.iter().map(|v| if v.is_finite() { v.to_string() } else { String::new() }))
            .context("writing CSV row")?;
    }
    writer.flush().context("flushing CSV")?;
    Ok(())
}

fn channel_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("c{i}")).collect()
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

/// Load a Parquet file whose numeric columns are channels.
///
/// Float64, Float32, Int64 and Int32 columns are read; other columns are
/// ignored. Nulls become missing values.
fn load_parquet(path: &Path) -> Result<Field> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let reader = builder.build().context("building parquet reader")?;

    let mut columns: Vec<Vec<f64>> = Vec::new();
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        let numeric: Vec<&ArrayRef> = batch
            .columns()
            .iter()
            .filter(|c| is_numeric(c.data_type()))
            .collect();
        if columns.is_empty() {
            columns = vec![Vec::new(); numeric.len()];
        }
        if numeric.len() != columns.len() {
            bail!("parquet batches disagree on the number of columns");
        }
        for (dst, col) in columns.iter_mut().zip(numeric) {
            dst.extend(column_values(col)?);
        }
    }

    if columns.is_empty() {
        bail!("Parquet file has no numeric column");
    }
    let n_times = columns[0].len();
    let values = Array2::from_shape_fn((n_times, columns.len()), |(t, c)| columns[c][t]);
    Field::from_series(stem(path), values).context("building field from parquet")
}

fn save_parquet(path: &Path, field: &Field) -> Result<()> {
    let matrix = field.to_matrix();
    let names = channel_names(matrix.ncols());
    let schema = Arc::new(Schema::new(
        names
            .iter()
            .map(|n| ArrowField::new(n, DataType::Float64, true))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = matrix
        .columns()
        .into_iter()
        .map(|col| {
            let values: Float64Array = col.iter().map(|v| v.is_finite().then_some(*v)).collect();
            Arc::new(values) as ArrayRef
        })
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

// -- Parquet / Arrow helpers --

fn is_numeric(dt: &DataType) -> bool {
    matches!(
        dt,
        DataType::Float64 | DataType::Float32 | DataType::Int64 | DataType::Int32
    )
}

/// Values of a numeric column, null as NaN.
fn column_values(col: &ArrayRef) -> Result<Vec<f64>> {
    let any = col.as_any();
    let values = match col.data_type() {
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .context("expected Float64Array")?
            .iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect(),
        DataType::Float32 => any
            .downcast_ref::<Float32Array>()
            .context("expected Float32Array")?
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .context("expected Int64Array")?
            .iter()
            .map(|v| v.map_or(f64::NAN, |i| i as f64))
            .collect(),
        DataType::Int32 => any
            .downcast_ref::<Int32Array>()
            .context("expected Int32Array")?
            .iter()
            .map(|v| v.map_or(f64::NAN, f64::from))
            .collect(),
        other => bail!("Expected a numeric column, got {other:?}"),
    };
    Ok(values)
}
