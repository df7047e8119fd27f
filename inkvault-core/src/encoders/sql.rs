/*!
Relational dump encoder (`.sql.gz`).

The column list comes from the keys of the first row only; fields that
appear solely in later rows are not exported.
*/

use super::{EncodeContext, Encoder};
use crate::artifact::ArtifactFormat;
use crate::compression::GzipCompressor;
use crate::record::Row;
use crate::Result;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// Rows per transaction
pub const BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlEncoder {
    compressor: GzipCompressor,
}

impl SqlEncoder {
    pub fn new(compressor: GzipCompressor) -> Self {
        Self { compressor }
    }

    /// Write the full script for `rows` into `out`
    pub fn write_script<W: Write>(
        &self,
        out: &mut W,
        rows: &[Row],
        ctx: &EncodeContext<'_>,
    ) -> std::io::Result<()> {
        writeln!(out, "-- Backup of collection: {}", ctx.collection_id)?;
        writeln!(out, "-- Exported at: {}", ctx.exported_at_rfc3339())?;
        writeln!(out, "-- Records: {}", rows.len())?;
        writeln!(out)?;

        let Some(first) = rows.first() else {
            return writeln!(out, "-- No rows to export");
        };
        let columns: Vec<&str> = first.keys().map(String::as_str).collect();
        let table = quote_identifier(ctx.collection_id);

        writeln!(out, "CREATE TABLE IF NOT EXISTS {table} (")?;
        for (i, column) in columns.iter().enumerate() {
            let separator = if i + 1 < columns.len() { "," } else { "" };
            writeln!(out, "  {} TEXT{separator}", quote_identifier(column))?;
        }
        writeln!(out, ");")?;
        writeln!(out)?;

        let column_list = columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");

        writeln!(out, "BEGIN;")?;
        for (i, row) in rows.iter().enumerate() {
            let values = columns
                .iter()
                .map(|column| sql_literal(row.get(*column).unwrap_or(&Value::Null)))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(out, "INSERT INTO {table} ({column_list}) VALUES ({values});")?;

            if (i + 1) % BATCH_SIZE == 0 && i + 1 < rows.len() {
                writeln!(out, "COMMIT;")?;
                writeln!(out, "BEGIN;")?;
            }
        }
        writeln!(out, "COMMIT;")
    }
}

impl Encoder for SqlEncoder {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Sql
    }

    fn encode(&self, rows: &[Row], ctx: &EncodeContext<'_>) -> Result<PathBuf> {
        let path = ctx.output_path(ArtifactFormat::Sql);
        let mut writer = self.compressor.stream_to_file(&path)?;
        self.write_script(&mut writer, rows, ctx)?;
        let path = writer.finish()?;
        debug!(collection = ctx.collection_id, path = %path.display(), "Wrote SQL dump");
        Ok(path)
    }
}

/// Backtick-quote an identifier, doubling embedded backticks
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Render a JSON value as a SQL literal
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_string(s),
        Value::Array(_) | Value::Object(_) => quote_string(&value.to_string()),
    }
}

fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
