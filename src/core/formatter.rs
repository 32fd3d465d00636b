use serde_json::Value;

use crate::models::instruction::OutputFormat;
use crate::models::processed::ProcessedValue;
use crate::models::table::Table;

/// 按声明的输出形态整形结果表
pub fn format_output(table: &Table, format: OutputFormat) -> Option<ProcessedValue> {
    match format {
        OutputFormat::Scalar => table
            .rows
            .first()
            .and_then(|row| row.first())
            .filter(|v| !v.is_null())
            .cloned()
            .map(ProcessedValue::Scalar),
        OutputFormat::Array => {
            let items = if table.columns.len() == 1 {
                table.rows.iter().map(|r| r[0].clone()).collect()
            } else {
                table
                    .rows
                    .iter()
                    .map(|r| Value::Array(r.clone()))
                    .collect()
            };
            Some(ProcessedValue::Array(items))
        }
        OutputFormat::Json => Some(ProcessedValue::Records(table.to_records())),
        OutputFormat::Dataframe => Some(ProcessedValue::Table(table.clone())),
    }
}
