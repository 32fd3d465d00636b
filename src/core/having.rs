//! HAVING 子句：只接受 `聚合 op 字面量 [AND ...]`，左侧必须是本指令声明的
//! 聚合表达式或其别名，字面量走参数绑定。

use regex::Regex;
use std::sync::OnceLock;

use crate::core::expr::{CompareOp, Condition, Literal};
use crate::error::{EtlError, Result};
use crate::models::instruction::Aggregation;

/// 解析后的单个 HAVING 项
#[derive(Debug, Clone, PartialEq)]
pub struct HavingTerm {
    /// SQL 侧使用的聚合表达式，如 `SUM(amount)`
    pub expression: String,
    /// 聚合结果列名 (别名优先)
    pub column: String,
    pub op: CompareOp,
    pub value: Literal,
}

impl HavingTerm {
    /// SQL 渲染用条件：左侧为聚合表达式
    pub fn sql_condition(&self) -> Condition {
        Condition::Compare {
            column: self.expression.clone(),
            op: self.op,
            value: self.value.clone(),
        }
    }

    /// 内存表求值用条件：左侧为结果列
    pub fn frame_condition(&self) -> Condition {
        Condition::Compare {
            column: self.column.clone(),
            op: self.op,
            value: self.value.clone(),
        }
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn resolve<'a>(aggregations: &'a [Aggregation], lhs: &str) -> Option<&'a Aggregation> {
    let lhs = normalize(lhs);
    aggregations
        .iter()
        .find(|a| normalize(&a.output_name()) == lhs || normalize(&a.sql_expression()) == lhs)
}

fn parse_literal(rhs: &str) -> Option<Literal> {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new(r"^'((?:[^']|'')*)'$").unwrap());
    if let Some(caps) = quoted.captures(rhs) {
        return Some(Literal::Text(caps[1].replace("''", "'")));
    }
    if let Ok(i) = rhs.parse::<i64>() {
        return Some(Literal::Int(i));
    }
    rhs.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(Literal::Float)
}

/// 解析一条 HAVING 文本；任何不符合语法的部分都视为非法指令
pub fn parse_having(raw: &str, aggregations: &[Aggregation]) -> Result<Vec<HavingTerm>> {
    static AND_SPLIT: OnceLock<Regex> = OnceLock::new();
    static TERM: OnceLock<Regex> = OnceLock::new();
    let and_split = AND_SPLIT.get_or_init(|| Regex::new(r"(?i)\s+and\s+").unwrap());
    let term = TERM.get_or_init(|| Regex::new(r"^\s*(.+?)\s*(>=|<=|!=|<>|=|>|<)\s*(.+?)\s*$").unwrap());

    let invalid = |why: &str| {
        EtlError::InvalidInstruction(format!("having condition {:?}: {}", raw, why))
    };

    let mut terms = Vec::new();
    for piece in and_split.split(raw.trim()) {
        let caps = term
            .captures(piece)
            .ok_or_else(|| invalid("expected `aggregate op literal`"))?;
        let agg = resolve(aggregations, &caps[1])
            .ok_or_else(|| invalid("left side is not a declared aggregate or alias"))?;
        let op = match &caps[2] {
            ">=" => CompareOp::Gte,
            "<=" => CompareOp::Lte,
            "!=" | "<>" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            _ => CompareOp::Eq,
        };
        let value = parse_literal(caps[3].trim())
            .ok_or_else(|| invalid("right side must be a number or a quoted string"))?;
        terms.push(HavingTerm {
            expression: agg.sql_expression(),
            column: agg.output_name(),
            op,
            value,
        });
    }
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggs() -> Vec<Aggregation> {
        vec![
            serde_json::from_value(json!({"function": "sum", "field": "amount", "alias": "total"})).unwrap(),
            serde_json::from_value(json!({"function": "count_distinct", "field": "user_id"})).unwrap(),
        ]
    }

    #[test]
    fn resolves_expression_and_alias() {
        let terms = parse_having("sum( amount ) > 50 AND total <= 1000.5", &aggs()).unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].expression, "SUM(amount)");
        assert_eq!(terms[0].column, "total");
        assert_eq!(terms[0].value, Literal::Int(50));
        assert_eq!(terms[1].op, CompareOp::Lte);
        assert_eq!(terms[1].value, Literal::Float(1000.5));

        let terms = parse_having("COUNT(DISTINCT user_id) <> 'O''Brien'", &aggs()).unwrap();
        assert_eq!(terms[0].column, "COUNT(DISTINCT user_id)");
        assert_eq!(terms[0].value, Literal::Text("O'Brien".into()));
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        for raw in [
            "1=1 UNION SELECT password, username FROM users",
            "SUM(amount) > 0 OR 1=1",
            "SUM(amount) > (SELECT max(x) FROM t)",
            "AVG(amount) > 3",
            "total > abc",
            "rank() over () < 3",
        ] {
            assert!(
                matches!(parse_having(raw, &aggs()), Err(EtlError::InvalidInstruction(_))),
                "accepted {:?}",
                raw
            );
        }
    }

    #[test]
    fn renders_parameterized_sql() {
        let terms = parse_having("total > 50", &aggs()).unwrap();
        let frag = terms[0].sql_condition().to_sql();
        assert_eq!(frag.to_inline(), "SUM(amount) > '50'");
        assert_eq!(frag.params(), vec![&Literal::Int(50)]);
    }
}
