use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::core::filter::is_identifier;
use crate::core::having::{parse_having, HavingTerm};
use crate::error::{EtlError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Select,
    Aggregate,
}

/// 过滤算子，未知算子一律退化为等值比较
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    In,
}

impl Operator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::In => "IN",
        }
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            ">" => Operator::Gt,
            "<" => Operator::Lt,
            ">=" => Operator::Gte,
            "<=" => Operator::Lte,
            "LIKE" => Operator::Like,
            "IN" => Operator::In,
            _ => Operator::Eq,
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_sql().to_string()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FilterCondition {
    pub column: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum AggFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    CountDistinct,
}

impl AggFunction {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggFunction::Sum => "SUM",
            AggFunction::Count | AggFunction::CountDistinct => "COUNT",
            AggFunction::Avg => "AVG",
            AggFunction::Min => "MIN",
            AggFunction::Max => "MAX",
        }
    }

    /// pandas agg 名称，仅用于审计输出
    pub fn pandas_name(&self) -> &'static str {
        match self {
            AggFunction::Sum => "sum",
            AggFunction::Count => "count",
            AggFunction::Avg => "mean",
            AggFunction::Min => "min",
            AggFunction::Max => "max",
            AggFunction::CountDistinct => "nunique",
        }
    }
}

impl TryFrom<String> for AggFunction {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        match raw.trim().to_lowercase().as_str() {
            "sum" => Ok(AggFunction::Sum),
            "count" => Ok(AggFunction::Count),
            "avg" | "mean" | "average" => Ok(AggFunction::Avg),
            "min" => Ok(AggFunction::Min),
            "max" => Ok(AggFunction::Max),
            "count_distinct" | "nunique" => Ok(AggFunction::CountDistinct),
            other => Err(format!("unknown aggregate function: {}", other)),
        }
    }
}

impl From<AggFunction> for String {
    fn from(f: AggFunction) -> Self {
        match f {
            AggFunction::CountDistinct => "count_distinct".to_string(),
            other => other.sql_name().to_lowercase(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Aggregation {
    pub function: AggFunction,
    #[serde(default)]
    pub field: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub having_condition: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    /// 结果列名：优先别名，否则为 `SUM(amount)` 形式
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(a) if !a.trim().is_empty() => a.trim().to_string(),
            _ => self.sql_expression(),
        }
    }

    pub fn sql_expression(&self) -> String {
        let field = self.field.trim();
        match self.function {
            AggFunction::CountDistinct => format!("COUNT(DISTINCT {})", field),
            f => format!("{}({})", f.sql_name(), field),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum CastType {
    Int,
    Float,
    Str,
    Bool,
    Date,
}

impl TryFrom<String> for CastType {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        match raw.trim().to_lowercase().as_str() {
            "int" | "integer" | "int64" | "bigint" => Ok(CastType::Int),
            "float" | "double" | "number" | "float64" | "decimal" => Ok(CastType::Float),
            "str" | "string" | "text" => Ok(CastType::Str),
            "bool" | "boolean" => Ok(CastType::Bool),
            "date" => Ok(CastType::Date),
            other => Err(format!("unknown cast target: {}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transformation {
    Cast {
        field: String,
        #[serde(alias = "to", alias = "data_type")]
        target_type: CastType,
    },
    Format {
        field: String,
        #[serde(alias = "format", alias = "template")]
        format_string: String,
    },
    Calculate {
        formula: String,
        #[serde(alias = "field")]
        target_field: String,
    },
}

impl Transformation {
    pub fn kind(&self) -> &'static str {
        match self {
            Transformation::Cast { .. } => "cast",
            Transformation::Format { .. } => "format",
            Transformation::Calculate { .. } => "calculate",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TimeConfig {
    pub field: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// 统计粒度 (daily/monthly...)，只记录不参与过滤
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub relative_period: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegionType {
    #[default]
    Exact,
    Contains,
    StartsWith,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RegionConfig {
    pub field: String,
    #[serde(default)]
    pub region_value: String,
    #[serde(default)]
    pub region_type: RegionType,
    #[serde(default)]
    pub region_level: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Scalar,
    Array,
    #[default]
    Json,
    Dataframe,
}

/// 占位符分析产出的 ETL 指令，单次调用内创建、编译、执行后即丢弃
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EtlInstruction {
    pub instruction_id: String,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub source_fields: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FilterCondition>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    #[serde(default)]
    pub time_config: Option<TimeConfig>,
    #[serde(default)]
    pub region_config: Option<RegionConfig>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl EtlInstruction {
    /// 结构性校验，失败时不会触达任何后端
    pub fn validate(&self) -> Result<()> {
        if !self.aggregations.is_empty() && self.query_type != QueryType::Aggregate {
            return Err(EtlError::InvalidInstruction(format!(
                "instruction {} declares aggregations but query_type is select",
                self.instruction_id
            )));
        }
        if self.query_type == QueryType::Aggregate && self.aggregations.is_empty() {
            return Err(EtlError::InvalidInstruction(format!(
                "instruction {} is an aggregate query without aggregations",
                self.instruction_id
            )));
        }
        for agg in &self.aggregations {
            if agg.field.trim().is_empty() {
                return Err(EtlError::InvalidInstruction(format!(
                    "aggregate function {} has no field",
                    agg.function.sql_name()
                )));
            }
            let field = agg.field.trim();
            if field != "*" && !is_identifier(field) {
                return Err(EtlError::InvalidInstruction(format!(
                    "aggregate field {:?} is not a valid column name",
                    field
                )));
            }
            if let Some(alias) = agg.alias.as_deref().map(str::trim) {
                if !alias.is_empty() && !is_identifier(alias) {
                    return Err(EtlError::InvalidInstruction(format!(
                        "aggregate alias {:?} is not a valid column name",
                        alias
                    )));
                }
            }
        }
        self.having_terms()?;
        for field in &self.source_fields {
            let field = field.trim();
            if field != "*" && !is_identifier(field) {
                return Err(EtlError::InvalidInstruction(format!(
                    "source field {:?} is not a valid column name",
                    field
                )));
            }
        }
        Ok(())
    }

    /// 所有聚合的分组字段并集，按出现顺序去重
    pub fn group_by_fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for g in self.aggregations.iter().flat_map(|a| a.group_by.iter()) {
            let g = g.trim();
            if g.is_empty() || !is_identifier(g) || out.iter().any(|x| x == g) {
                continue;
            }
            // 分组字段必须出现在 source_fields 中 (source_fields 为空时不做约束)
            if !self.source_fields.is_empty() && !self.source_fields.iter().any(|f| f == g) {
                continue;
            }
            out.push(g.to_string());
        }
        out
    }

    /// 所有聚合的 HAVING 解析结果，按声明顺序 AND 连接
    pub fn having_terms(&self) -> Result<Vec<HavingTerm>> {
        let mut terms = Vec::new();
        for raw in self
            .aggregations
            .iter()
            .filter_map(|a| a.having_condition.as_deref())
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            terms.extend(parse_having(raw, &self.aggregations)?);
        }
        Ok(terms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TimeRange {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// 外层报告任务传入的覆盖配置，例如报告期
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TaskConfig {
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) if s.trim().is_empty() => Vec::new(),
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}
