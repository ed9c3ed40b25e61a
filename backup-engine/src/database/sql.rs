//! SQL text generation for export files.

use super::SqlValue;
use std::fmt::Write;

/// Quote an identifier with double quotes, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a value as a SQL literal.
pub fn literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) if f.is_finite() => {
            let text = f.to_string();
            if text.contains(['.', 'e', 'E']) {
                text
            } else {
                format!("{text}.0")
            }
        }
        SqlValue::Real(_) => "NULL".to_string(),
        SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        SqlValue::Blob(bytes) => format!("X'{}'", hex::encode_upper(bytes)),
    }
}

/// Header written at the top of every table export.
pub fn export_header(table: &str, total_rows: u64) -> String {
    format!(
        "-- Table: {table}\n-- Estimated rows: {total_rows}\n-- Exported: {}\n\n",
        chrono::Utc::now().to_rfc3339()
    )
}

/// Drop + create statements for a table.
pub fn structure(quoted_table: &str, create_statement: &str) -> String {
    let create = create_statement.trim().trim_end_matches(';');
    format!("DROP TABLE IF EXISTS {quoted_table};\n{create};\n\n")
}

/// One INSERT statement per row, appended to `out`.
pub fn append_inserts(
    out: &mut String,
    quoted_table: &str,
    quoted_columns: &[String],
    rows: &[Vec<SqlValue>],
) {
    let column_list = if quoted_columns.is_empty() {
        String::new()
    } else {
        format!(" ({})", quoted_columns.join(", "))
    };
    for row in rows {
        let values: Vec<String> = row.iter().map(literal).collect();
        let _ = writeln!(
            out,
            "INSERT INTO {quoted_table}{column_list} VALUES ({});",
            values.join(", ")
        );
    }
}
