//! 指令编译：SQL 数据源生成完整语句，文件类数据源生成 pandas 风格的操作序列。
//! 两条路径共享同一组条件构建器，只在渲染时分叉。

use tracing::{debug, info, warn};

use crate::core::expr::{py_str, Backend, Condition, Literal, SqlDialect, SqlFragment};
use crate::core::filter::{build_condition, is_identifier};
use crate::core::having::HavingTerm;
use crate::core::region::build_region_condition;
use crate::core::time_window::{TimeWindow, TimeWindowResolver};
use crate::error::{EtlError, Result};
use crate::models::datasource::{BackendKind, DataSource};
use crate::models::instruction::{Aggregation, EtlInstruction, QueryType, TaskConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    statement: SqlFragment,
}

impl SqlQuery {
    pub fn new(statement: SqlFragment) -> Self {
        Self { statement }
    }

    /// 字面量内联后的语句，仅用于审计与日志
    pub fn text(&self) -> String {
        self.statement.to_inline()
    }

    pub fn parameterized(&self, dialect: SqlDialect) -> (String, Vec<Literal>) {
        self.statement.to_parameterized(dialect)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOp {
    Load {
        kind: BackendKind,
        path: String,
    },
    Filter {
        condition: Condition,
    },
    Select {
        columns: Vec<String>,
    },
    Aggregate {
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
        having: Vec<HavingTerm>,
    },
}

impl FrameOp {
    /// 等价的 pandas 语句
    pub fn describe(&self) -> String {
        match self {
            FrameOp::Load { kind, path } => match kind {
                BackendKind::Json => format!("df = pd.read_json({})", py_str(path)),
                _ => format!("df = pd.read_csv({})", py_str(path)),
            },
            FrameOp::Filter { condition } => format!("df = df[{}]", condition.to_pandas().0),
            FrameOp::Select { columns } => format!("df = df[{}]", py_list(columns)),
            FrameOp::Aggregate {
                group_by,
                aggregations,
                having,
            } => {
                let specs: Vec<String> = aggregations
                    .iter()
                    .map(|a| {
                        format!(
                            "{}: ({}, {})",
                            py_str(&a.output_name()),
                            py_str(a.field.trim()),
                            py_str(a.function.pandas_name())
                        )
                    })
                    .collect();
                let mut line = if group_by.is_empty() {
                    format!("df = df.agg(**{{{}}})", specs.join(", "))
                } else {
                    format!(
                        "df = df.groupby({}).agg(**{{{}}}).reset_index()",
                        py_list(group_by),
                        specs.join(", ")
                    )
                };
                for h in having {
                    line.push_str(&format!("\ndf = df[{}]", h.frame_condition().to_pandas().0));
                }
                line
            }
        }
    }
}

fn py_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| py_str(s)).collect();
    format!("[{}]", quoted.join(", "))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledQuery {
    Sql(SqlQuery),
    Frame(Vec<FrameOp>),
}

impl CompiledQuery {
    pub fn backend(&self) -> Backend {
        match self {
            CompiledQuery::Sql(_) => Backend::Sql,
            CompiledQuery::Frame(_) => Backend::Pandas,
        }
    }

    /// 写入 ProcessedData.query_executed 的审计文本
    pub fn describe(&self) -> String {
        match self {
            CompiledQuery::Sql(q) => q.text(),
            CompiledQuery::Frame(ops) => ops
                .iter()
                .map(FrameOp::describe)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Compilation {
    pub query: CompiledQuery,
    pub time_window: Option<TimeWindow>,
    /// 实际进入 AND 链的条件数
    pub conditions_applied: usize,
    /// 因列名/值为空而被略去的过滤列
    pub skipped_filters: Vec<String>,
}

pub struct QueryCompiler {
    resolver: TimeWindowResolver,
    default_table: Option<String>,
}

impl QueryCompiler {
    pub fn new(resolver: TimeWindowResolver, default_table: Option<String>) -> Self {
        Self {
            resolver,
            default_table,
        }
    }

    pub fn compile(
        &self,
        instruction: &EtlInstruction,
        source: &DataSource,
        task: Option<&TaskConfig>,
    ) -> Result<Compilation> {
        instruction.validate()?;

        let mut conditions = Vec::new();
        let mut skipped_filters = Vec::new();
        for f in &instruction.filters {
            match build_condition(f) {
                Some(c) => conditions.push(c),
                None => {
                    warn!("过滤条件为空或非法，已略过: column={:?}", f.column);
                    skipped_filters.push(f.column.clone());
                }
            }
        }

        let time_window = instruction
            .time_config
            .as_ref()
            .and_then(|cfg| self.resolver.resolve(cfg, task));
        if let Some(c) = time_window.as_ref().and_then(TimeWindow::condition) {
            conditions.push(c);
        }

        if let Some(c) = instruction
            .region_config
            .as_ref()
            .and_then(build_region_condition)
        {
            conditions.push(c);
        }

        let conditions_applied = conditions.len();
        let query = if source.source_type.is_sql() {
            CompiledQuery::Sql(self.compile_sql(instruction, source, &conditions)?)
        } else {
            CompiledQuery::Frame(self.compile_frame(instruction, source, conditions)?)
        };
        info!(
            "指令 {} 编译完成 ({} 个条件): {}",
            instruction.instruction_id,
            conditions_applied,
            query.describe()
        );

        Ok(Compilation {
            query,
            time_window,
            conditions_applied,
            skipped_filters,
        })
    }

    fn compile_sql(
        &self,
        instruction: &EtlInstruction,
        source: &DataSource,
        conditions: &[Condition],
    ) -> Result<SqlQuery> {
        let table = source
            .target_table(self.default_table.as_deref())
            .ok_or_else(|| {
                EtlError::InvalidDataSource(format!("data source {} has no target table", source.id))
            })?;
        if !is_identifier(table) {
            return Err(EtlError::InvalidDataSource(format!(
                "table name {:?} is not a valid identifier",
                table
            )));
        }

        let group_by = instruction.group_by_fields();
        let projection: Vec<String> = match instruction.query_type {
            QueryType::Select => {
                let fields: Vec<String> = instruction
                    .source_fields
                    .iter()
                    .map(|f| f.trim().to_string())
                    .collect();
                if fields.is_empty() {
                    vec!["*".to_string()]
                } else {
                    fields
                }
            }
            QueryType::Aggregate => instruction
                .aggregations
                .iter()
                .map(|a| match a.alias.as_deref().map(str::trim) {
                    Some(alias) if !alias.is_empty() => {
                        format!("{} AS {}", a.sql_expression(), alias)
                    }
                    _ => a.sql_expression(),
                })
                .chain(group_by.iter().cloned())
                .collect(),
        };

        let mut stmt = SqlFragment::from_raw(format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            table
        ));

        if !conditions.is_empty() {
            stmt.raw(" WHERE ");
            for (i, c) in conditions.iter().enumerate() {
                if i > 0 {
                    stmt.raw(" AND ");
                }
                stmt.append(c.to_sql());
            }
        }

        if instruction.query_type == QueryType::Aggregate {
            if !group_by.is_empty() {
                stmt.raw(format!(" GROUP BY {}", group_by.join(", ")));
            }
            let having = instruction.having_terms()?;
            for (i, term) in having.iter().enumerate() {
                stmt.raw(if i == 0 { " HAVING " } else { " AND " });
                stmt.append(term.sql_condition().to_sql());
            }
        }

        debug!("SQL 绑定参数数量: {}", stmt.params().len());
        Ok(SqlQuery::new(stmt))
    }

    fn compile_frame(
        &self,
        instruction: &EtlInstruction,
        source: &DataSource,
        conditions: Vec<Condition>,
    ) -> Result<Vec<FrameOp>> {
        let path = source
            .file_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                EtlError::InvalidDataSource(format!("data source {} has no file path", source.id))
            })?;

        let mut ops = vec![FrameOp::Load {
            kind: source.source_type,
            path: path.to_string(),
        }];
        ops.extend(conditions.into_iter().map(|condition| FrameOp::Filter { condition }));

        match instruction.query_type {
            QueryType::Select => {
                let columns: Vec<String> = instruction
                    .source_fields
                    .iter()
                    .map(|f| f.trim().to_string())
                    .filter(|f| f != "*")
                    .collect();
                if !columns.is_empty() {
                    ops.push(FrameOp::Select { columns });
                }
            }
            QueryType::Aggregate => ops.push(FrameOp::Aggregate {
                group_by: instruction.group_by_fields(),
                aggregations: instruction.aggregations.clone(),
                having: instruction.having_terms()?,
            }),
        }
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn compiler() -> QueryCompiler {
        QueryCompiler::new(
            TimeWindowResolver::new(NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()),
            None,
        )
    }

    fn sql_source(table: &str) -> DataSource {
        DataSource {
            id: "ds_sql".into(),
            display_name: None,
            source_type: BackendKind::Sql,
            connection_string: Some("postgres://localhost/report".into()),
            file_path: None,
            wide_table_name: None,
            table_name: Some(table.into()),
        }
    }

    fn csv_source() -> DataSource {
        DataSource {
            id: "ds_csv".into(),
            display_name: None,
            source_type: BackendKind::Csv,
            connection_string: None,
            file_path: Some("/data/complaints.csv".into()),
            wide_table_name: None,
            table_name: None,
        }
    }

    fn inst(v: serde_json::Value) -> EtlInstruction {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn scalar_select_scenario() {
        let i = inst(json!({
            "instruction_id": "c1",
            "query_type": "select",
            "source_fields": ["count"],
            "filters": [{"column": "status", "operator": "=", "value": "resolved"}],
            "output_format": "scalar"
        }));
        let c = compiler().compile(&i, &sql_source("complaints"), None).unwrap();
        assert_eq!(
            c.query.describe(),
            "SELECT count FROM complaints WHERE status = 'resolved'"
        );
    }

    #[test]
    fn select_with_filters_and_time_window() {
        let i = inst(json!({
            "instruction_id": "c2",
            "source_fields": ["id", "region"],
            "filters": [
                {"column": "status", "operator": "=", "value": "resolved"},
                {"column": "level", "operator": ">=", "value": 2}
            ],
            "time_config": {"field": "created_at", "relative_period": "last_month", "period": "monthly"}
        }));
        let c = compiler().compile(&i, &sql_source("complaints"), None).unwrap();
        let sql = c.query.describe();
        assert!(sql.starts_with("SELECT id, region FROM complaints WHERE "));
        assert!(sql.contains("status = 'resolved' AND level >= '2'"));
        assert!(sql.contains("created_at >= '2024-05-01' AND created_at <= '2024-05-31'"));
        assert!(!sql.contains("GROUP BY"));
        assert_eq!(c.conditions_applied, 3);
    }

    #[test]
    fn where_is_omitted_without_conditions() {
        let i = inst(json!({
            "instruction_id": "c3",
            "source_fields": ["a"],
            "filters": [{"column": "b", "operator": "=", "value": ""}]
        }));
        let c = compiler().compile(&i, &sql_source("t"), None).unwrap();
        assert_eq!(c.query.describe(), "SELECT a FROM t");
        assert_eq!(c.skipped_filters, vec!["b".to_string()]);
    }

    #[test]
    fn aggregate_with_group_by_and_having() {
        let i = inst(json!({
            "instruction_id": "c4",
            "query_type": "aggregate",
            "source_fields": ["amount", "region"],
            "region_config": {"field": "region", "region_value": "华", "region_type": "starts_with", "region_level": "province"},
            "aggregations": [{
                "function": "sum",
                "field": "amount",
                "group_by": ["region"],
                "having_condition": "SUM(amount) > 100"
            }]
        }));
        let c = compiler().compile(&i, &sql_source("orders"), None).unwrap();
        assert_eq!(
            c.query.describe(),
            "SELECT SUM(amount), region FROM orders WHERE region LIKE '华%' ESCAPE '!' GROUP BY region HAVING SUM(amount) > '100'"
        );
        let CompiledQuery::Sql(q) = c.query else {
            panic!("expected sql");
        };
        let (sql, binds) = q.parameterized(SqlDialect::Postgres);
        assert!(sql.ends_with("GROUP BY region HAVING SUM(amount) > $2"));
        assert_eq!(binds, vec![Literal::Text("华%".into()), Literal::Int(100)]);
    }

    #[test]
    fn aggregate_without_group_by_omits_clauses() {
        let i = inst(json!({
            "instruction_id": "c5",
            "query_type": "aggregate",
            "aggregations": [{"function": "count", "field": "*", "alias": "total"}]
        }));
        let c = compiler().compile(&i, &sql_source("orders"), None).unwrap();
        assert_eq!(c.query.describe(), "SELECT COUNT(*) AS total FROM orders");
    }

    #[test]
    fn structurally_invalid_instruction_fails_before_backend() {
        let i = inst(json!({
            "instruction_id": "c6",
            "query_type": "aggregate",
            "aggregations": [{"function": "avg", "field": ""}]
        }));
        assert!(matches!(
            compiler().compile(&i, &sql_source("orders"), None),
            Err(EtlError::InvalidInstruction(_))
        ));
    }

    #[test]
    fn missing_table_is_a_data_source_error() {
        let mut src = sql_source("x");
        src.table_name = None;
        let i = inst(json!({"instruction_id": "c7", "source_fields": ["a"]}));
        assert!(matches!(
            compiler().compile(&i, &src, None),
            Err(EtlError::InvalidDataSource(_))
        ));
        let with_default = QueryCompiler::new(TimeWindowResolver::from_clock(), Some("wide_t".into()));
        assert_eq!(
            with_default.compile(&i, &src, None).unwrap().query.describe(),
            "SELECT a FROM wide_t"
        );
    }

    #[test]
    fn frame_pipeline_for_file_sources() {
        let i = inst(json!({
            "instruction_id": "c8",
            "source_fields": ["region", "count"],
            "filters": [{"column": "status", "operator": "IN", "value": ["open", "pending"]}],
            "region_config": {"field": "region", "region_value": "南山", "region_type": "contains"}
        }));
        let c = compiler().compile(&i, &csv_source(), None).unwrap();
        assert_eq!(c.query.backend(), Backend::Pandas);
        assert_eq!(
            c.query.describe(),
            "df = pd.read_csv('/data/complaints.csv')\n\
             df = df[df['status'].isin(['open', 'pending'])]\n\
             df = df[df['region'].str.contains('南山', regex=False)]\n\
             df = df[['region', 'count']]"
        );
    }

    #[test]
    fn parameterized_form_binds_literals() {
        let i = inst(json!({
            "instruction_id": "c9",
            "source_fields": ["count"],
            "filters": [{"column": "status", "operator": "=", "value": "resolved"}]
        }));
        let c = compiler().compile(&i, &sql_source("complaints"), None).unwrap();
        let CompiledQuery::Sql(q) = c.query else {
            panic!("expected sql");
        };
        let (sql, binds) = q.parameterized(SqlDialect::Postgres);
        assert_eq!(sql, "SELECT count FROM complaints WHERE status = $1");
        assert_eq!(binds.len(), 1);
    }
}
