use client::QueryResult;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Render query rows as a table, headed by the column names.
pub fn render_rows(result: &QueryResult) -> String {
    if result.columns.is_empty() && result.is_empty() {
        return "<empty>".into();
    }

    let mut builder = Builder::default();
    if !result.columns.is_empty() {
        builder.push_record(result.columns.iter().cloned());
    }
    for row in &result.values {
        builder.push_record(row.iter().map(format_value));
    }

    let mut table = builder.build();
    table.with(Style::modern());
    table.to_string()
}

/// Format a single JSON value for display.
pub fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".into(),
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
