//! SQL statement builders. Everything here is plain text generation for a
//! string-concatenated dialect; the single escaping routine lives in this
//! module and nowhere else.
use crate::model::{FieldValue, Record};
use crate::schema::{sql_type, EntityType, FieldType, SchemaCatalog, SchemaError, UNDEFINED_SENTINEL};
use serde_json::Value;

/// Maximum rows per generated INSERT statement.
pub const INSERT_CHUNK_ROWS: usize = 1000;

/// Replace embedded single quotes with double quotes.
///
/// Textual escape only, kept for wire compatibility with the feed's
/// historical loader. Not injection-safe.
fn escape_value(raw: &str) -> String {
    raw.replace('\'', "\"")
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn column_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|n| format!("[{n}]"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Statement listing a table's live column names.
pub fn live_columns(table: &str) -> String {
    format!("SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS WHERE table_name = '{table}'")
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE [dbo].[{table}]")
}

/// Purge statement removing every row.
pub fn truncate(table: &str) -> String {
    format!("TRUNCATE TABLE [dbo].[{table}];")
}

/// Purge statement removing rows whose date field falls inside the job's
/// configured range (dates are `YYYY-MM-DD`, stamped to day bounds).
pub fn delete_between(table: &str, date_field: &str, from: &str, to: &str) -> String {
    format!(
        "DELETE FROM [dbo].[{table}] WHERE [{date_field}] BETWEEN '{from}T00:00:00' and '{to}T23:59:59';"
    )
}

fn create_statement(name: &str, entity: &EntityType, indexes: &[String]) -> String {
    let columns = entity
        .column_fields()
        .map(|f| {
            let declared = match &f.ty {
                FieldType::Primitive(declared) => declared.as_str(),
                FieldType::CollectionOf(_) => unreachable!("column_fields filters collections"),
            };
            format!("[{}] {} NULL", f.name, sql_type(declared))
        })
        .collect::<Vec<_>>()
        .join(",\n");

    let mut stmt = format!(
        "IF NOT EXISTS \n(SELECT * FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = N'{name}') \nBEGIN\nCREATE TABLE [dbo].[{name}](\n{columns}) ON [PRIMARY];"
    );
    if !indexes.is_empty() {
        let fields = indexes
            .iter()
            .map(|f| format!("[{f}] ASC"))
            .collect::<Vec<_>>()
            .join(", ");
        stmt.push_str(&format!(
            "\nCREATE CLUSTERED INDEX [{name}] ON [dbo].[{name}]({fields})"
        ));
    }
    stmt.push_str("\nEND;");
    stmt
}

/// Guarded "create table if missing" DDL for `entity_name` as `name`, one
/// statement per table: the parent first, then recursively one child table
/// `name_field` per nested-collection field.
pub fn create_table(
    name: &str,
    entity_name: &str,
    catalog: &SchemaCatalog,
    indexes: &[String],
) -> Result<Vec<String>, SchemaError> {
    let entity = catalog.get(entity_name)?;
    let mut statements = vec![create_statement(name, entity, indexes)];
    for (field, child_entity) in entity.collection_fields() {
        let child_name = format!("{name}_{field}");
        statements.extend(create_table(&child_name, child_entity, catalog, indexes)?);
    }
    Ok(statements)
}

/// Destructive rebuild DDL from an inferred flat schema: guarded drop, then
/// an unconditional create. Used by the link-following path, which has no
/// `$metadata` document.
pub fn rebuild_table(name: &str, entity: &EntityType) -> String {
    let columns = entity
        .column_fields()
        .map(|f| {
            let declared = match &f.ty {
                FieldType::Primitive(declared) => declared.as_str(),
                FieldType::CollectionOf(_) => unreachable!("column_fields filters collections"),
            };
            format!("[{}] {} NULL", f.name, sql_type(declared))
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "IF EXISTS \n(SELECT * FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_NAME = N'{name}') \nBEGIN\nDROP TABLE [dbo].[{name}]\nEND;\nCREATE TABLE [dbo].[{name}](\n{columns}) ON [PRIMARY];"
    )
}

/// Convert records into batched INSERT statements, at most
/// [`INSERT_CHUNK_ROWS`] rows each. The column order is fixed once from the
/// first record and reused for every row. List-valued fields recurse into
/// `table_field` child inserts, which precede the parent statements in the
/// returned list.
pub fn insert_statements(table: &str, records: &[Record]) -> Vec<String> {
    let Some(first) = records.first() else {
        return Vec::new();
    };

    // Canonical batch order: the first record's field iteration order.
    let mask: Vec<&str> = first.field_names().collect();
    let columns: Vec<&str> = first
        .fields()
        .filter(|(_, v)| !v.is_rows())
        .map(|(n, _)| n)
        .collect();

    let mut statements = Vec::new();
    let mut rows: Vec<String> = Vec::new();

    for record in records {
        let mut values = Vec::new();
        for field in &mask {
            match record.get(field) {
                Some(FieldValue::Rows(sub)) => {
                    if !sub.is_empty() {
                        let child = format!("{table}_{field}");
                        statements.extend(insert_statements(&child, sub));
                    }
                }
                Some(FieldValue::Scalar(value)) => {
                    let mut text = stringify(value);
                    if text == UNDEFINED_SENTINEL {
                        text = String::new();
                    }
                    values.push(format!("'{}'", escape_value(&text)));
                }
                None => values.push("''".to_string()),
            }
        }
        rows.push(format!("({})", values.join(", ")));
    }

    if !columns.is_empty() {
        let prefix = format!(
            "INSERT INTO [dbo].[{table}] ({}) VALUES ",
            column_list(&columns)
        );
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            statements.push(format!("{prefix}{}", chunk.join(", ")));
        }
    }

    statements
}
