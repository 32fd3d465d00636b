use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};

use crate::models::table::Table;

pub fn row_columns<R: Row>(row: &R) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// 按 Postgres 原生类型名取值，列顺序与查询投影一致
pub fn pg_row_values(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|col| {
            let i = col.ordinal();
            match col.type_info().name() {
                "INT2" => json!(row.try_get::<Option<i16>, _>(i).unwrap_or(None)),
                "INT4" => json!(row.try_get::<Option<i32>, _>(i).unwrap_or(None)),
                "INT8" => json!(row.try_get::<Option<i64>, _>(i).unwrap_or(None)),
                "FLOAT4" => json!(row.try_get::<Option<f32>, _>(i).unwrap_or(None)),
                "FLOAT8" => json!(row.try_get::<Option<f64>, _>(i).unwrap_or(None)),
                "NUMERIC" => {
                    let v: Option<rust_decimal::Decimal> = row.try_get(i).unwrap_or(None);
                    // 金额等数值转 f64，便于后续计算与置信度统计
                    json!(v.and_then(|d| d.to_f64()))
                }
                "BOOL" => json!(row.try_get::<Option<bool>, _>(i).unwrap_or(None)),
                "DATE" => json!(row
                    .try_get::<Option<NaiveDate>, _>(i)
                    .unwrap_or(None)
                    .map(|d| d.to_string())),
                "TIMESTAMP" => json!(row
                    .try_get::<Option<NaiveDateTime>, _>(i)
                    .unwrap_or(None)
                    .map(|dt| dt.to_string())),
                "TIMESTAMPTZ" => json!(row
                    .try_get::<Option<DateTime<Utc>>, _>(i)
                    .unwrap_or(None)
                    .map(|dt| dt.to_rfc3339())),
                "JSON" | "JSONB" => row
                    .try_get::<Option<Value>, _>(i)
                    .unwrap_or(None)
                    .unwrap_or(Value::Null),
                // TEXT / VARCHAR / BPCHAR / NAME 以及未知类型，尝试转为字符串
                _ => json!(row.try_get::<Option<String>, _>(i).unwrap_or(None)),
            }
        })
        .collect()
}

pub fn mysql_row_values(row: &MySqlRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|col| {
            let i = col.ordinal();
            match col.type_info().name() {
                "TINYINT" | "SMALLINT" | "INT" | "MEDIUMINT" => {
                    json!(row.try_get::<Option<i32>, _>(i).unwrap_or(None))
                }
                "BIGINT" => json!(row.try_get::<Option<i64>, _>(i).unwrap_or(None)),
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "INT UNSIGNED" | "MEDIUMINT UNSIGNED"
                | "BIGINT UNSIGNED" => json!(row.try_get::<Option<u64>, _>(i).unwrap_or(None)),
                "FLOAT" => json!(row.try_get::<Option<f32>, _>(i).unwrap_or(None)),
                "DOUBLE" => json!(row.try_get::<Option<f64>, _>(i).unwrap_or(None)),
                "DECIMAL" | "NEWDECIMAL" => {
                    let v: Option<rust_decimal::Decimal> = row.try_get(i).unwrap_or(None);
                    json!(v.and_then(|d| d.to_f64()))
                }
                "BOOLEAN" => json!(row.try_get::<Option<bool>, _>(i).unwrap_or(None)),
                "DATE" => json!(row
                    .try_get::<Option<NaiveDate>, _>(i)
                    .unwrap_or(None)
                    .map(|d| d.to_string())),
                "DATETIME" | "TIMESTAMP" => json!(row
                    .try_get::<Option<NaiveDateTime>, _>(i)
                    .unwrap_or(None)
                    .map(|dt| dt.to_string())),
                "JSON" => row
                    .try_get::<Option<Value>, _>(i)
                    .unwrap_or(None)
                    .unwrap_or(Value::Null),
                _ => json!(row.try_get::<Option<String>, _>(i).unwrap_or(None)),
            }
        })
        .collect()
}

/// 结果行转表；无结果时列信息不可得，返回空表
pub fn rows_to_table<R: Row>(rows: &[R], values: impl Fn(&R) -> Vec<Value>) -> Table {
    let mut table = Table::new(rows.first().map(row_columns).unwrap_or_default());
    for row in rows {
        table.push_row(values(row));
    }
    table
}
