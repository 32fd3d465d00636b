use serde_json::Value;
use std::fs;
use tracing::info;

use crate::error::{EtlError, Result};
use crate::models::datasource::BackendKind;
use crate::models::table::Table;

/// 表格文件读取器，文件类数据源的加载入口
pub trait TableReader: Send + Sync {
    fn read(&self, kind: BackendKind, path: &str) -> Result<Table>;
}

pub struct LocalFileReader {
    delimiter: u8,
}

impl LocalFileReader {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    fn read_csv(&self, path: &str) -> Result<Table> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .from_path(path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut table = Table::new(headers);
        for record in rdr.records() {
            let record = record?;
            table.push_row(record.iter().map(infer_cell).collect());
        }
        Ok(table)
    }

    fn read_json(&self, path: &str) -> Result<Table> {
        let raw = fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&raw)? {
            Value::Array(records) => Ok(Table::from_records(&records)),
            _ => Err(EtlError::InvalidDataSource(format!(
                "{} is not a JSON array of records",
                path
            ))),
        }
    }
}

impl TableReader for LocalFileReader {
    fn read(&self, kind: BackendKind, path: &str) -> Result<Table> {
        let table = match kind {
            BackendKind::Csv => self.read_csv(path)?,
            BackendKind::Json => self.read_json(path)?,
            BackendKind::Sql => {
                return Err(EtlError::UnsupportedBackend(
                    "sql sources are not read from files".into(),
                ))
            }
        };
        info!("文件 {} 读取完成: {} 行 {} 列", path, table.len(), table.columns.len());
        Ok(table)
    }
}

/// CSV 单元格类型推断：空 → null，整数、浮点、布尔，其余保留字符串
pub fn infer_cell(raw: &str) -> Value {
    let s = raw.trim();
    if s.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match s {
        "true" | "True" | "TRUE" => Value::Bool(true),
        "false" | "False" | "FALSE" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}
