use thiserror::Error;

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    #[error("Data source not found: {0}")]
    DataSourceNotFound(String),

    #[error("Invalid data source: {0}")]
    InvalidDataSource(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Column not found: {0}")]
    MissingColumn(String),

    #[error("Transformation error: {0}")]
    Transformation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EtlError {
    /// 运行期故障 (数据源缺失、连接、SQL、文件) 转换为失败结果，不向调用方抛出
    pub fn is_operational(&self) -> bool {
        !matches!(self, EtlError::InvalidInstruction(_) | EtlError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_not_operational() {
        assert!(!EtlError::InvalidInstruction("x".into()).is_operational());
        assert!(!EtlError::Config("x".into()).is_operational());
        assert!(EtlError::DataSourceNotFound("ds".into()).is_operational());
        assert!(EtlError::Connection("refused".into()).is_operational());
        assert!(EtlError::Parameter("abc as INT4".into()).is_operational());
    }
}
