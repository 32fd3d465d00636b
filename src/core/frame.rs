use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::core::compiler::FrameOp;
use crate::core::expr::{cell_f64, cell_text};
use crate::error::Result;
use crate::models::instruction::{AggFunction, Aggregation};
use crate::models::table::Table;

/// 在内存表上依次执行操作序列 (Load 已由执行器完成)，返回结果表与过程备注
pub fn apply_ops(mut table: Table, ops: &[FrameOp]) -> Result<(Table, Vec<String>)> {
    let mut notes = Vec::new();
    for op in ops {
        match op {
            FrameOp::Load { .. } => {}
            FrameOp::Filter { condition } => {
                let missing: Vec<&str> = condition
                    .referenced_columns()
                    .into_iter()
                    .filter(|c| table.column_index(c).is_none())
                    .collect();
                if !missing.is_empty() {
                    warn!("过滤列不存在，跳过该条件: {:?}", missing);
                    notes.push(format!("filter skipped, missing column(s): {}", missing.join(", ")));
                    continue;
                }
                let columns = table.columns.clone();
                let before = table.len();
                table.retain_rows(|row| condition.matches(&columns, row));
                debug!("过滤: {} -> {} 行", before, table.len());
            }
            FrameOp::Select { columns } => {
                table = table.select(columns)?;
            }
            FrameOp::Aggregate {
                group_by,
                aggregations,
                having,
            } => {
                table = aggregate(&table, group_by, aggregations)?;
                for term in having {
                    let cond = term.frame_condition();
                    let columns = table.columns.clone();
                    let before = table.len();
                    table.retain_rows(|row| cond.matches(&columns, row));
                    debug!("HAVING {}: {} -> {} 行", term.expression, before, table.len());
                }
            }
        }
    }
    Ok((table, notes))
}

/// 分组聚合，输出列顺序与 SQL 路径一致：聚合列在前，分组列在后
pub fn aggregate(table: &Table, group_by: &[String], aggregations: &[Aggregation]) -> Result<Table> {
    let group_idx = group_by
        .iter()
        .map(|g| table.require_column(g))
        .collect::<Result<Vec<_>>>()?;
    let agg_idx = aggregations
        .iter()
        .map(|a| match a.field.trim() {
            "*" => Ok(None),
            f => table.require_column(f).map(Some),
        })
        .collect::<Result<Vec<_>>>()?;

    // 分组保持首次出现顺序
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (ri, row) in table.rows.iter().enumerate() {
        let key = group_idx
            .iter()
            .map(|&i| row[i].to_string())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(ri);
    }
    // 无分组时即便没有数据也输出一行，与 SQL 语义一致
    if group_by.is_empty() && groups.is_empty() {
        groups.push(Vec::new());
    }

    let mut columns: Vec<String> = aggregations.iter().map(Aggregation::output_name).collect();
    columns.extend(group_by.iter().cloned());
    let mut out = Table::new(columns);

    for members in &groups {
        let mut row: Vec<Value> = aggregations
            .iter()
            .zip(&agg_idx)
            .map(|(a, idx)| {
                let values: Vec<&Value> = match idx {
                    Some(i) => members.iter().map(|&r| &table.rows[r][*i]).collect(),
                    None => Vec::new(),
                };
                reduce(a.function, idx.is_none(), members.len(), &values)
            })
            .collect();
        if let Some(&first) = members.first() {
            row.extend(group_idx.iter().map(|&i| table.rows[first][i].clone()));
        }
        out.push_row(row);
    }
    Ok(out)
}

fn reduce(func: AggFunction, star: bool, row_count: usize, values: &[&Value]) -> Value {
    let present: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();
    match func {
        AggFunction::Count if star => Value::from(row_count as u64),
        AggFunction::Count => Value::from(present.len() as u64),
        AggFunction::CountDistinct => {
            let distinct: HashSet<String> = present.iter().map(|v| v.to_string()).collect();
            Value::from(distinct.len() as u64)
        }
        AggFunction::Sum => {
            let nums: Vec<f64> = present.iter().filter_map(|v| cell_f64(v)).collect();
            if nums.is_empty() {
                Value::Null
            } else if present.iter().all(|v| v.is_i64()) {
                // 整数溢出时退回浮点求和
                present
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .try_fold(0i64, i64::checked_add)
                    .map(Value::from)
                    .unwrap_or_else(|| Value::from(nums.iter().sum::<f64>()))
            } else {
                Value::from(nums.iter().sum::<f64>())
            }
        }
        AggFunction::Avg => {
            let nums: Vec<f64> = present.iter().filter_map(|v| cell_f64(v)).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                Value::from(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggFunction::Min | AggFunction::Max => {
            let want_max = func == AggFunction::Max;
            let numeric = !present.is_empty() && present.iter().all(|v| cell_f64(v).is_some());
            let best = present.iter().copied().reduce(|a, b| {
                let ord = if numeric {
                    cell_f64(a)
                        .partial_cmp(&cell_f64(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                } else {
                    cell_text(a).cmp(&cell_text(b))
                };
                let take_b = if want_max { ord.is_lt() } else { ord.is_gt() };
                if take_b {
                    b
                } else {
                    a
                }
            });
            best.cloned().unwrap_or(Value::Null)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expr::{CompareOp, Condition, Literal};
    use crate::core::having::{parse_having, HavingTerm};
    use crate::models::datasource::BackendKind;
    use serde_json::json;

    fn orders() -> Table {
        Table::from_records(&[
            json!({"region": "华东", "amount": 100, "status": "paid"}),
            json!({"region": "华北", "amount": 40, "status": "paid"}),
            json!({"region": "华东", "amount": 60, "status": "refund"}),
            json!({"region": "华南", "amount": null, "status": "paid"}),
        ])
    }

    fn agg(v: serde_json::Value) -> Aggregation {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn group_sum_keeps_first_seen_order() {
        let t = aggregate(
            &orders(),
            &["region".to_string()],
            &[agg(json!({"function": "sum", "field": "amount"}))],
        )
        .unwrap();
        assert_eq!(t.columns, vec!["SUM(amount)", "region"]);
        assert_eq!(
            t.rows,
            vec![
                vec![json!(160), json!("华东")],
                vec![json!(40), json!("华北")],
                vec![Value::Null, json!("华南")],
            ]
        );
    }

    #[test]
    fn ungrouped_aggregates() {
        let t = aggregate(
            &orders(),
            &[],
            &[
                agg(json!({"function": "count", "field": "*", "alias": "n"})),
                agg(json!({"function": "count", "field": "amount"})),
                agg(json!({"function": "avg", "field": "amount"})),
                agg(json!({"function": "max", "field": "region"})),
                agg(json!({"function": "count_distinct", "field": "status"})),
            ],
        )
        .unwrap();
        assert_eq!(t.rows[0][0], json!(4));
        assert_eq!(t.rows[0][1], json!(3));
        assert_eq!(t.rows[0][2], json!(200.0 / 3.0));
        assert_eq!(t.rows[0][4], json!(2));

        let empty = aggregate(
            &Table::new(vec!["amount".into()]),
            &[],
            &[agg(json!({"function": "count", "field": "*"}))],
        )
        .unwrap();
        assert_eq!(empty.rows, vec![vec![json!(0)]]);
    }

    fn having(raw: &str, aggregations: &[Aggregation]) -> Vec<HavingTerm> {
        parse_having(raw, aggregations).unwrap()
    }

    #[test]
    fn having_filters_aggregated_rows() {
        let aggregations = vec![agg(json!({"function": "sum", "field": "amount"}))];
        let ops = vec![FrameOp::Aggregate {
            group_by: vec!["region".into()],
            having: having("sum( amount ) > 50", &aggregations),
            aggregations,
        }];
        let (t, notes) = apply_ops(orders(), &ops).unwrap();
        assert!(notes.is_empty());
        assert_eq!(t.len(), 1);
        assert_eq!(t.rows[0][1], json!("华东"));
    }

    #[test]
    fn expression_having_applies_to_aliased_column() {
        let table = Table::from_records(&[
            json!({"region": "华东", "amount": 100}),
            json!({"region": "华北", "amount": 40}),
            json!({"region": "华南", "amount": 10}),
        ]);
        let aggregations = vec![agg(json!({"function": "sum", "field": "amount", "alias": "total"}))];
        for raw in ["SUM(amount) > 50", "total > 50"] {
            let ops = vec![FrameOp::Aggregate {
                group_by: vec!["region".into()],
                having: having(raw, &aggregations),
                aggregations: aggregations.clone(),
            }];
            let (t, notes) = apply_ops(table.clone(), &ops).unwrap();
            assert!(notes.is_empty(), "{}", raw);
            assert_eq!(t.columns, vec!["total", "region"]);
            assert_eq!(t.rows, vec![vec![json!(100), json!("华东")]], "{}", raw);
        }
    }

    #[test]
    fn integer_sum_overflow_falls_back_to_float() {
        let t = Table::from_records(&[json!({"v": i64::MAX}), json!({"v": 1})]);
        let out = aggregate(&t, &[], &[agg(json!({"function": "sum", "field": "v"}))]).unwrap();
        let sum = out.rows[0][0].as_f64().unwrap();
        assert!(!out.rows[0][0].is_i64());
        assert!((sum - 9.223372036854776e18).abs() < 1e4);
    }

    #[test]
    fn filter_on_missing_column_is_skipped() {
        let ops = vec![
            FrameOp::Load {
                kind: BackendKind::Csv,
                path: "x.csv".into(),
            },
            FrameOp::Filter {
                condition: Condition::Compare {
                    column: "city".into(),
                    op: CompareOp::Eq,
                    value: Literal::Text("深圳".into()),
                },
            },
            FrameOp::Filter {
                condition: Condition::Compare {
                    column: "status".into(),
                    op: CompareOp::Eq,
                    value: Literal::Text("paid".into()),
                },
            },
            FrameOp::Select {
                columns: vec!["amount".into()],
            },
        ];
        let (t, notes) = apply_ops(orders(), &ops).unwrap();
        assert_eq!(t.columns, vec!["amount"]);
        assert_eq!(t.len(), 3);
        assert!(notes[0].contains("city"));
    }

    #[test]
    fn select_missing_column_fails() {
        let ops = vec![FrameOp::Select {
            columns: vec!["nope".into()],
        }];
        assert!(apply_ops(orders(), &ops).is_err());
    }
}
