use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::table::Table;

/// 按 output_format 整形后的结果值
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessedValue {
    Scalar(Value),
    Array(Vec<Value>),
    Records(Vec<Map<String, Value>>),
    Table(Table),
}

impl ProcessedValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ProcessedValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ProcessedValue::Scalar(Value::Null))
    }
}

/// 一次 ETL 执行的产出，由调用方即时消费，不在本模块持久化
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedData {
    pub raw_data: Table,
    pub processed_value: Option<ProcessedValue>,
    pub metadata: Map<String, Value>,
    /// 耗时 (秒)
    pub processing_time: f64,
    pub confidence: f64,
    pub query_executed: String,
    pub rows_processed: usize,
}

impl ProcessedData {
    /// 失败结果：值为空、置信度为 0，错误写入 metadata.error
    pub fn failure(
        mut metadata: Map<String, Value>,
        error: impl Into<String>,
        query_executed: String,
        processing_time: f64,
    ) -> Self {
        metadata.insert("error".to_string(), Value::String(error.into()));
        Self {
            raw_data: Table::default(),
            processed_value: None,
            metadata,
            processing_time,
            confidence: 0.0,
            query_executed,
            rows_processed: 0,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_shape() {
        let mut meta = Map::new();
        meta.insert("instruction_id".into(), json!("i1"));
        let pd = ProcessedData::failure(meta, "boom", String::new(), 0.01);
        assert_eq!(pd.confidence, 0.0);
        assert!(pd.processed_value.is_none());
        assert_eq!(pd.error(), Some("boom"));
        assert!(!pd.is_success());
        assert_eq!(pd.metadata["instruction_id"], json!("i1"));
    }

    #[test]
    fn scalar_serializes_untagged() {
        let v = ProcessedValue::Scalar(json!(42));
        assert_eq!(serde_json::to_value(&v).unwrap(), json!(42));
    }
}
