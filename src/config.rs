use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EtlError, Result};

#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// 数据源目录所在库，未配置时只能使用内存目录
    pub catalog_database_url: Option<String>,
    /// 批量执行时的并发上限，按数据源连接数设置
    pub max_concurrency: usize,
    /// SQL 数据源既没有宽表也没有表名时的兜底表
    pub default_table: Option<String>,
    pub csv_delimiter: u8,
    pub connect_timeout: Duration,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            catalog_database_url: None,
            max_concurrency: 4,
            default_table: None,
            csv_delimiter: b',',
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl EtlConfig {
    /// 从环境变量加载 (调用方负责先执行 dotenvy::dotenv)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_concurrency = parse_var::<usize>("ETL_MAX_CONCURRENCY")?
            .unwrap_or(defaults.max_concurrency)
            .max(1);

        let csv_delimiter = match non_empty_var("ETL_CSV_DELIMITER") {
            Some(d) if d.len() == 1 => d.as_bytes()[0],
            Some(d) => {
                return Err(EtlError::Config(format!(
                    "ETL_CSV_DELIMITER must be a single byte, got {:?}",
                    d
                )))
            }
            None => defaults.csv_delimiter,
        };

        let connect_timeout = parse_var::<u64>("ETL_CONNECT_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout);

        Ok(Self {
            catalog_database_url: non_empty_var("DATABASE_URL"),
            max_concurrency,
            default_table: non_empty_var("ETL_DEFAULT_TABLE"),
            csv_delimiter,
            connect_timeout,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match non_empty_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EtlError::Config(format!("{} has invalid value {:?}", key, raw))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EtlConfig::default();
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.csv_delimiter, b',');
        assert!(cfg.default_table.is_none());
    }

    #[test]
    fn rejects_unparseable_numbers() {
        env::set_var("ETL_TEST_BAD_NUMBER", "four");
        let err = parse_var::<usize>("ETL_TEST_BAD_NUMBER").unwrap_err();
        assert!(matches!(err, EtlError::Config(_)));
        env::remove_var("ETL_TEST_BAD_NUMBER");
    }

    #[test]
    fn blank_values_count_as_unset() {
        env::set_var("ETL_TEST_BLANK", "   ");
        assert!(non_empty_var("ETL_TEST_BLANK").is_none());
        env::remove_var("ETL_TEST_BLANK");
    }
}
