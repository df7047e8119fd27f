/*!
Spreadsheet encoder (`.xlsx`).

Produces a workbook with one data sheet named after the collection and a
`Metadata` sheet describing the export. The header row is the union of all
row keys in first-seen order. Workbooks are already zip-compressed, so no
gzip layer is added.
*/

use super::{EncodeContext, Encoder};
use crate::artifact::ArtifactFormat;
use crate::record::Row;
use crate::{BackupError, Result};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

/// Longest sheet name the format allows
pub const MAX_SHEET_NAME_LEN: usize = 31;
/// Longest text a single cell may hold
pub const MAX_CELL_LEN: usize = 32_767;
/// Data rows available below the header
pub const MAX_DATA_ROWS: usize = 1_048_575;
pub const MAX_COLUMNS: usize = 16_384;

pub const METADATA_SHEET: &str = "Metadata";
pub const EMPTY_PLACEHOLDER: &str = "No data";
const SOURCE_NAME: &str = "Appwrite";

#[derive(Debug, Clone, Copy, Default)]
pub struct XlsxEncoder;

impl XlsxEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for XlsxEncoder {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Xlsx
    }

    fn encode(&self, rows: &[Row], ctx: &EncodeContext<'_>) -> Result<PathBuf> {
        let columns = collect_columns(rows);
        if rows.len() > MAX_DATA_ROWS {
            return Err(BackupError::validation(format!(
                "{} has {} rows, more than a worksheet can hold",
                ctx.collection_id,
                rows.len()
            )));
        }
        if columns.len() > MAX_COLUMNS {
            return Err(BackupError::validation(format!(
                "{} has {} distinct fields, more than a worksheet can hold",
                ctx.collection_id,
                columns.len()
            )));
        }

        let mut workbook = Workbook::new();
        let bold = Format::new().set_bold();

        let data_sheet = workbook.add_worksheet();
        data_sheet.set_name(sheet_name(ctx.collection_id))?;
        if rows.is_empty() {
            data_sheet.write_string(0, 0, EMPTY_PLACEHOLDER)?;
        } else {
            for (col, name) in columns.iter().enumerate() {
                data_sheet.write_string_with_format(0, col as u16, truncate_cell(name), &bold)?;
            }
            for (index, row) in rows.iter().enumerate() {
                let sheet_row = index as u32 + 1;
                for (col, name) in columns.iter().enumerate() {
                    if let Some(value) = row.get(name.as_str()) {
                        write_cell(data_sheet, sheet_row, col as u16, value)?;
                    }
                }
            }
        }

        let meta = workbook.add_worksheet();
        meta.set_name(METADATA_SHEET)?;
        meta.write_string_with_format(0, 0, "Field", &bold)?;
        meta.write_string_with_format(0, 1, "Value", &bold)?;
        meta.write_string(1, 0, "Collection")?;
        meta.write_string(1, 1, ctx.collection_id)?;
        meta.write_string(2, 0, "Records")?;
        meta.write_number(2, 1, rows.len() as f64)?;
        meta.write_string(3, 0, "Exported At")?;
        meta.write_string(3, 1, ctx.exported_at_rfc3339())?;
        meta.write_string(4, 0, "Source")?;
        meta.write_string(4, 1, SOURCE_NAME)?;

        let path = ctx.output_path(ArtifactFormat::Xlsx);
        workbook.save(&path)?;
        debug!(
            collection = ctx.collection_id,
            rows = rows.len(),
            columns = columns.len(),
            path = %path.display(),
            "Wrote workbook"
        );
        Ok(path)
    }
}

/// Union of all row keys, in the order they are first seen
pub fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.as_str()) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Make a collection identifier usable as a sheet name
///
/// Characters the format forbids (`[ ] : * ? / \`) become `_`, the result is
/// cut to 31 characters, and a name clashing with the metadata sheet is
/// suffixed.
pub fn sheet_name(collection_id: &str) -> String {
    let cleaned: String = collection_id
        .chars()
        .map(|c| match c {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim_matches('\'');

    let mut name: String = cleaned.chars().take(MAX_SHEET_NAME_LEN).collect();
    if name.is_empty() {
        name = "Data".to_string();
    }
    if name.eq_ignore_ascii_case(METADATA_SHEET) {
        name.push_str("_data");
    }
    name
}

fn truncate_cell(text: &str) -> String {
    match text.char_indices().nth(MAX_CELL_LEN) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

fn write_cell(sheet: &mut Worksheet, row: u32, col: u16, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(b) => {
            sheet.write_boolean(row, col, *b)?;
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) => {
                sheet.write_number(row, col, f)?;
            }
            None => {
                sheet.write_string(row, col, n.to_string())?;
            }
        },
        Value::String(s) => {
            sheet.write_string(row, col, truncate_cell(s))?;
        }
        Value::Array(_) | Value::Object(_) => {
            sheet.write_string(row, col, truncate_cell(&value.to_string()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn encode(dir: &TempDir, collection_id: &str, rows: &[Row]) -> PathBuf {
        let ctx = EncodeContext {
            collection_id,
            exported_at: Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap(),
            file_stem: "export",
            output_dir: dir.path(),
        };
        XlsxEncoder::new().encode(rows, &ctx).unwrap()
    }

    #[test]
    fn test_sheet_name_sanitizing() {
        assert_eq!(sheet_name("posts"), "posts");
        assert_eq!(sheet_name("a/b:c*d?e[f]g\\h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sheet_name(&"x".repeat(40)).chars().count(), 31);
        assert_eq!(sheet_name("metadata"), "metadata_data");
        assert_eq!(sheet_name("''"), "Data");
    }

    #[test]
    fn test_columns_are_union_in_first_seen_order() {
        let rows = vec![
            row(json!({"$id": "a", "title": "x"})),
            row(json!({"$id": "b", "summary": "y", "title": "z"})),
        ];
        assert_eq!(collect_columns(&rows), vec!["$id", "title", "summary"]);
    }

    #[test]
    fn test_truncate_cell() {
        let long = "é".repeat(MAX_CELL_LEN + 10);
        assert_eq!(truncate_cell(&long).chars().count(), MAX_CELL_LEN);
        assert_eq!(truncate_cell("short"), "short");
    }

    #[test]
    fn test_workbook_contents() {
        let temp_dir = TempDir::new().unwrap();
        let rows = vec![
            row(json!({"$id": "a", "title": "Hello", "views": 3, "draft": false})),
            row(json!({"$id": "b", "title": "World", "tags": ["x", "y"]})),
        ];
        let path = encode(&temp_dir, "posts", &rows);
        assert!(path.ends_with("export.xlsx"));

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), vec!["posts", "Metadata"]);

        let data = workbook.worksheet_range("posts").unwrap();
        assert_eq!(data.height(), 3);
        assert_eq!(data.get_value((0, 4)), Some(&Data::String("tags".into())));
        assert_eq!(data.get_value((1, 1)), Some(&Data::String("Hello".into())));
        assert_eq!(data.get_value((1, 2)), Some(&Data::Float(3.0)));
        assert_eq!(data.get_value((1, 3)), Some(&Data::Bool(false)));
        assert_eq!(
            data.get_value((2, 4)),
            Some(&Data::String(r#"["x","y"]"#.into()))
        );

        let meta = workbook.worksheet_range(METADATA_SHEET).unwrap();
        assert_eq!(meta.get_value((1, 1)), Some(&Data::String("posts".into())));
        assert_eq!(meta.get_value((2, 1)), Some(&Data::Float(2.0)));
        assert_eq!(
            meta.get_value((3, 1)),
            Some(&Data::String("2024-03-10T02:00:00.000Z".into()))
        );
        assert_eq!(meta.get_value((4, 1)), Some(&Data::String("Appwrite".into())));
    }

    #[test]
    fn test_empty_rows_write_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let path = encode(&temp_dir, "tags", &[]);

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        let data = workbook.worksheet_range("tags").unwrap();
        assert_eq!(data.get_size(), (1, 1));
        assert_eq!(
            data.get_value((0, 0)),
            Some(&Data::String(EMPTY_PLACEHOLDER.into()))
        );
    }
}
