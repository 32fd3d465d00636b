use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::warn;

use crate::core::expr::{Backend, CompareOp, Condition, Literal};
use crate::models::instruction::{FilterCondition, Operator};

/// 列名/表名白名单：字母 (含中文)、数字、下划线，可带一级 schema 前缀
pub fn is_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| {
            Regex::new(r"^[\p{L}_][\p{L}\p{N}_]*(\.[\p{L}_][\p{L}\p{N}_]*)?$").unwrap()
        })
        .is_match(name)
}

/// 单个过滤三元组转条件；列或值为空时返回 None，由调用方从 AND 链中略去
pub fn build_condition(filter: &FilterCondition) -> Option<Condition> {
    let column = filter.column.trim();
    if column.is_empty() {
        return None;
    }
    if !is_identifier(column) {
        warn!("忽略非法过滤列名: {:?}", column);
        return None;
    }
    let column = column.to_string();

    match filter.operator {
        Operator::In => {
            let items: Vec<Literal> = match &filter.value {
                Value::Array(items) => items.iter().filter_map(Literal::from_json).collect(),
                other => Literal::from_json(other).into_iter().collect(),
            };
            if items.is_empty() {
                return None;
            }
            Some(Condition::In {
                column,
                values: items,
            })
        }
        Operator::Like => {
            let needle = Literal::from_json(&filter.value)?.display();
            Some(Condition::Contains { column, needle })
        }
        op => {
            let value = Literal::from_json(&filter.value)?;
            let op = match op {
                Operator::Ne => CompareOp::Ne,
                Operator::Gt => CompareOp::Gt,
                Operator::Lt => CompareOp::Lt,
                Operator::Gte => CompareOp::Gte,
                Operator::Lte => CompareOp::Lte,
                _ => CompareOp::Eq,
            };
            Some(Condition::Compare { column, op, value })
        }
    }
}

pub fn build_filter(filter: &FilterCondition, backend: Backend) -> String {
    build_condition(filter)
        .map(|c| c.render(backend).text())
        .unwrap_or_default()
}

pub fn build_filter_sql(filter: &FilterCondition) -> String {
    build_filter(filter, Backend::Sql)
}

pub fn build_filter_pandas(filter: &FilterCondition) -> String {
    build_filter(filter, Backend::Pandas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn f(column: &str, op: &str, value: Value) -> FilterCondition {
        FilterCondition {
            column: column.to_string(),
            operator: Operator::from(op.to_string()),
            value,
        }
    }

    #[test]
    fn renders_every_operator_for_sql() {
        let cases = [
            ("=", json!("resolved"), "status = 'resolved'"),
            (">", json!(10), "status > '10'"),
            ("<", json!(10), "status < '10'"),
            (">=", json!(10), "status >= '10'"),
            ("<=", json!(10), "status <= '10'"),
            ("!=", json!("open"), "status != 'open'"),
            ("LIKE", json!("投诉"), "status LIKE '%投诉%' ESCAPE '!'"),
            ("IN", json!(["a", "b"]), "status IN ('a', 'b')"),
        ];
        for (op, value, expected) in cases {
            assert_eq!(build_filter_sql(&f("status", op, value)), expected, "op {}", op);
        }
    }

    #[test]
    fn renders_every_operator_for_pandas() {
        let cases = [
            ("=", json!("resolved"), "df['status'] == 'resolved'"),
            ("==", json!(true), "df['status'] == True"),
            (">", json!(10), "df['status'] > 10"),
            ("<", json!(10), "df['status'] < 10"),
            (">=", json!(3), "df['status'] >= 3"),
            ("<=", json!(2.5), "df['status'] <= 2.5"),
            ("!=", json!("open"), "df['status'] != 'open'"),
            ("<>", json!("open"), "df['status'] != 'open'"),
            ("MATCHES", json!("x"), "df['status'] == 'x'"),
            ("=", json!("O'Brien"), "df['status'] == 'O\\'Brien'"),
            ("=", json!("a\\b"), "df['status'] == 'a\\\\b'"),
            ("LIKE", json!("投诉"), "df['status'].str.contains('投诉', regex=False)"),
            ("IN", json!(["a", "b"]), "df['status'].isin(['a', 'b'])"),
        ];
        for (op, value, expected) in cases {
            assert_eq!(build_filter_pandas(&f("status", op, value)), expected, "op {}", op);
        }
    }

    #[test]
    fn empty_column_or_value_yields_empty_string() {
        assert_eq!(build_filter_sql(&f("", "=", json!("x"))), "");
        assert_eq!(build_filter_sql(&f("status", "=", json!(""))), "");
        assert_eq!(build_filter_sql(&f("status", "=", Value::Null)), "");
        assert_eq!(build_filter_pandas(&f("status", "IN", json!([]))), "");
        assert_eq!(build_filter_pandas(&f("", "LIKE", json!("x"))), "");
    }

    #[test]
    fn unknown_operator_falls_back_to_equality() {
        assert_eq!(
            build_filter_sql(&f("status", "MATCHES", json!("x"))),
            "status = 'x'"
        );
    }

    #[test]
    fn rejects_injected_column_names() {
        assert_eq!(build_filter_sql(&f("a = a OR 1", "=", json!("x"))), "");
        assert!(is_identifier("投诉_状态"));
        assert!(is_identifier("public.complaints"));
        assert!(!is_identifier("1abc"));
    }
}
