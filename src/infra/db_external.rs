use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlConnection};
use sqlx::postgres::{PgArguments, PgConnection, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, Either, Executor, MySql, Postgres, Statement, TypeInfo};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::compiler::SqlQuery;
use crate::core::expr::{Literal, SqlDialect};
use crate::error::{EtlError, Result};
use crate::infra::utils::{mysql_row_values, pg_row_values, rows_to_table};
use crate::models::table::Table;

/// 关系库连接器：接收连接串与编译后的查询，返回结果表
#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn fetch(&self, connection_string: &str, query: &SqlQuery) -> Result<Table>;
}

pub fn dialect_of(connection_string: &str) -> Result<SqlDialect> {
    let scheme = connection_string
        .split("://")
        .next()
        .unwrap_or_default()
        .to_lowercase();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(SqlDialect::Postgres),
        "mysql" | "mariadb" => Ok(SqlDialect::MySql),
        other => Err(EtlError::UnsupportedBackend(format!(
            "unsupported connection scheme: {}",
            other
        ))),
    }
}

pub enum DynamicConnection {
    Postgres(PgConnection),
    MySql(MySqlConnection),
}

/// 基于 sqlx 的连接器：每次调用独立建连，执行完毕即关闭，不共享连接池
pub struct SqlxConnector {
    connect_timeout: Duration,
}

impl SqlxConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, url: &str, dialect: SqlDialect) -> Result<DynamicConnection> {
        let connecting = async {
            match dialect {
                SqlDialect::Postgres => PgConnection::connect(url).await.map(DynamicConnection::Postgres),
                SqlDialect::MySql => MySqlConnection::connect(url).await.map(DynamicConnection::MySql),
            }
        };
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(EtlError::Connection(e.to_string())),
            Err(_) => Err(EtlError::Connection(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

/// 按服务端推断类型转换后的 Postgres 参数
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Text(String),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
}

impl From<Literal> for PgValue {
    fn from(lit: Literal) -> Self {
        match lit {
            Literal::Text(s) => PgValue::Text(s),
            Literal::Int(i) => PgValue::Int8(i),
            Literal::Float(f) => PgValue::Float8(f),
            Literal::Bool(b) => PgValue::Bool(b),
            Literal::Date(d) => PgValue::Date(d),
        }
    }
}

fn literal_int(lit: &Literal) -> Option<i64> {
    match lit {
        Literal::Int(i) => Some(*i),
        Literal::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
        Literal::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// 把字面量转换为服务端推断出的参数类型，与内联单引号字面量的隐式转换保持一致；
/// 未识别的类型按字面量自身类型绑定
pub fn coerce_pg(lit: Literal, type_name: &str) -> Result<PgValue> {
    let text = lit.display();
    let bad = || EtlError::Parameter(format!("{:?} is not a valid {} value", text, type_name));
    let value = match type_name {
        "INT2" => PgValue::Int2(
            literal_int(&lit)
                .and_then(|i| i16::try_from(i).ok())
                .ok_or_else(bad)?,
        ),
        "INT4" => PgValue::Int4(
            literal_int(&lit)
                .and_then(|i| i32::try_from(i).ok())
                .ok_or_else(bad)?,
        ),
        "INT8" => PgValue::Int8(literal_int(&lit).ok_or_else(bad)?),
        "FLOAT4" => PgValue::Float4(text.trim().parse().map_err(|_| bad())?),
        "FLOAT8" => PgValue::Float8(text.trim().parse().map_err(|_| bad())?),
        "NUMERIC" => PgValue::Numeric(text.trim().parse().map_err(|_| bad())?),
        "BOOL" => PgValue::Bool(match &lit {
            Literal::Bool(b) => *b,
            _ => match text.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "on" | "1" => true,
                "false" | "f" | "no" | "n" | "off" | "0" => false,
                _ => return Err(bad()),
            },
        }),
        "DATE" => PgValue::Date(match &lit {
            Literal::Date(d) => *d,
            _ => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| bad())?,
        }),
        "TIMESTAMP" => PgValue::Timestamp(parse_timestamp(&text).ok_or_else(bad)?),
        "TIMESTAMPTZ" => PgValue::TimestampTz(
            DateTime::parse_from_rfc3339(text.trim())
                .map(|d| d.with_timezone(&Utc))
                .ok()
                .or_else(|| parse_timestamp(&text).map(|dt| dt.and_utc()))
                .ok_or_else(bad)?,
        ),
        "UUID" => PgValue::Uuid(Uuid::parse_str(text.trim()).map_err(|_| bad())?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => PgValue::Text(text),
        _ => PgValue::from(lit),
    };
    Ok(value)
}

fn bind_pg(q: Query<'_, Postgres, PgArguments>, v: PgValue) -> Query<'_, Postgres, PgArguments> {
    match v {
        PgValue::Text(s) => q.bind(s),
        PgValue::Int2(i) => q.bind(i),
        PgValue::Int4(i) => q.bind(i),
        PgValue::Int8(i) => q.bind(i),
        PgValue::Float4(f) => q.bind(f),
        PgValue::Float8(f) => q.bind(f),
        PgValue::Numeric(d) => q.bind(d),
        PgValue::Bool(b) => q.bind(b),
        PgValue::Date(d) => q.bind(d),
        PgValue::Timestamp(t) => q.bind(t),
        PgValue::TimestampTz(t) => q.bind(t),
        PgValue::Uuid(u) => q.bind(u),
    }
}

/// 先 prepare 取得服务端推断的参数类型，再按类型绑定执行
async fn fetch_pg(conn: &mut PgConnection, sql: &str, binds: Vec<Literal>) -> Result<Vec<PgRow>> {
    let stmt = (&mut *conn).prepare(sql).await?;
    let types: Vec<String> = match stmt.parameters() {
        Some(Either::Left(types)) => types.iter().map(|t| t.name().to_string()).collect(),
        _ => Vec::new(),
    };
    debug!("参数推断类型: {:?}", types);
    let values = binds
        .into_iter()
        .enumerate()
        .map(|(i, lit)| match types.get(i) {
            Some(t) => coerce_pg(lit, t),
            None => Ok(PgValue::from(lit)),
        })
        .collect::<Result<Vec<_>>>()?;
    let rows = values
        .into_iter()
        .fold(stmt.query(), bind_pg)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

fn bind_mysql(q: Query<'_, MySql, MySqlArguments>, lit: Literal) -> Query<'_, MySql, MySqlArguments> {
    match lit {
        Literal::Text(s) => q.bind(s),
        Literal::Int(i) => q.bind(i),
        Literal::Float(f) => q.bind(f),
        Literal::Bool(b) => q.bind(b),
        Literal::Date(d) => q.bind(d),
    }
}

#[async_trait]
impl SqlConnector for SqlxConnector {
    async fn fetch(&self, connection_string: &str, query: &SqlQuery) -> Result<Table> {
        let dialect = dialect_of(connection_string)?;
        let (sql, binds) = query.parameterized(dialect);
        debug!("参数化 SQL: {} ({} 个参数)", sql, binds.len());

        let conn = self.open(connection_string, dialect).await?;
        let table = match conn {
            DynamicConnection::Postgres(mut c) => {
                let res = fetch_pg(&mut c, &sql, binds).await;
                let _ = c.close().await;
                rows_to_table(&res?, pg_row_values)
            }
            DynamicConnection::MySql(mut c) => {
                let q = binds.into_iter().fold(sqlx::query(&sql), bind_mysql);
                let res = q.fetch_all(&mut c).await;
                let _ = c.close().await;
                rows_to_table(&res?, mysql_row_values)
            }
        };
        info!("外部数据源返回 {} 行", table.len());
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_from_scheme() {
        assert_eq!(dialect_of("postgres://u@h/db").unwrap(), SqlDialect::Postgres);
        assert_eq!(dialect_of("postgresql://u@h/db").unwrap(), SqlDialect::Postgres);
        assert_eq!(dialect_of("MySQL://u@h/db").unwrap(), SqlDialect::MySql);
        assert!(matches!(
            dialect_of("sqlite://x.db"),
            Err(EtlError::UnsupportedBackend(_))
        ));
    }

    #[test]
    fn literals_follow_inferred_parameter_types() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(coerce_pg(Literal::Text("123".into()), "INT4").unwrap(), PgValue::Int4(123));
        assert_eq!(coerce_pg(Literal::Int(2), "VARCHAR").unwrap(), PgValue::Text("2".into()));
        assert_eq!(
            coerce_pg(Literal::Date(date), "TEXT").unwrap(),
            PgValue::Text("2024-01-31".into())
        );
        assert_eq!(
            coerce_pg(Literal::Date(date), "TIMESTAMP").unwrap(),
            PgValue::Timestamp(date.and_hms_opt(0, 0, 0).unwrap())
        );
        assert_eq!(
            coerce_pg(Literal::Text("12.50".into()), "NUMERIC").unwrap(),
            PgValue::Numeric(Decimal::new(1250, 2))
        );
        assert_eq!(coerce_pg(Literal::Text("t".into()), "BOOL").unwrap(), PgValue::Bool(true));
        assert_eq!(coerce_pg(Literal::Int(7), "FLOAT8").unwrap(), PgValue::Float8(7.0));
        assert_eq!(
            coerce_pg(Literal::Text("x".into()), "my_enum").unwrap(),
            PgValue::Text("x".into())
        );
    }

    #[test]
    fn uncoercible_literal_is_a_parameter_error() {
        assert!(matches!(
            coerce_pg(Literal::Text("abc".into()), "INT4"),
            Err(EtlError::Parameter(_))
        ));
        assert!(matches!(
            coerce_pg(Literal::Int(70000), "INT2"),
            Err(EtlError::Parameter(_))
        ));
        assert!(coerce_pg(Literal::Text("not-a-date".into()), "DATE").is_err());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connection_error() {
        let connector = SqlxConnector::new(Duration::from_millis(500));
        let q = SqlQuery::new(crate::core::expr::SqlFragment::from_raw("SELECT 1"));
        let err = connector
            .fetch("postgres://nobody@127.0.0.1:1/none", &q)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Connection(_)));
    }
}
