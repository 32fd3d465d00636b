use serde::{Deserialize, Serialize};

/// 数据源后端类型：关系库走 SQL，文件类走内存表操作
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    Sql,
    Csv,
    Json,
}

impl BackendKind {
    pub fn is_sql(&self) -> bool {
        matches!(self, BackendKind::Sql)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sql => "sql",
            BackendKind::Csv => "csv",
            BackendKind::Json => "json",
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        match raw.trim().to_lowercase().as_str() {
            "sql" | "postgres" | "postgresql" | "mysql" | "database" => Ok(BackendKind::Sql),
            "csv" | "file" => Ok(BackendKind::Csv),
            "json" => Ok(BackendKind::Json),
            other => Err(format!("unsupported source_type: {}", other)),
        }
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

/// 数据源描述，执行器只读使用
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DataSource {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub source_type: BackendKind,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub wide_table_name: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
}

impl DataSource {
    /// FROM 目标：宽表 > 表名 > 全局兜底
    pub fn target_table<'a>(&'a self, fallback: Option<&'a str>) -> Option<&'a str> {
        [self.wide_table_name.as_deref(), self.table_name.as_deref(), fallback]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wide_table_wins_over_table_name() {
        let ds: DataSource = serde_json::from_value(json!({
            "id": "ds1",
            "source_type": "postgres",
            "connection_string": "postgres://localhost/report",
            "wide_table_name": "complaints_wide",
            "table_name": "complaints"
        }))
        .unwrap();
        assert_eq!(ds.source_type, BackendKind::Sql);
        assert_eq!(ds.target_table(Some("fallback")), Some("complaints_wide"));
    }

    #[test]
    fn blank_names_fall_through_to_default() {
        let ds: DataSource = serde_json::from_value(json!({
            "id": "ds2",
            "source_type": "sql",
            "wide_table_name": " "
        }))
        .unwrap();
        assert_eq!(ds.target_table(Some("t_default")), Some("t_default"));
        assert_eq!(ds.target_table(None), None);
    }

    #[test]
    fn rejects_unknown_source_type() {
        let res: Result<DataSource, _> =
            serde_json::from_value(json!({"id": "x", "source_type": "excel"}));
        assert!(res.is_err());
    }
}
