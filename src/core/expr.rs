//! 与后端无关的条件模型。
//!
//! 过滤、时间、地区三类构建器都产出 [`Condition`]，再由编译器按数据源
//! 选择渲染目标：SQL 片段 (字面量以参数形式保留) 或 pandas 布尔索引表达式。
//! 文件类数据源在内存中直接用 [`Condition::matches`] 求值。

use chrono::NaiveDate;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Literal {
    /// null、空串、空数组视为“无值”
    pub fn from_json(value: &Value) -> Option<Literal> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Literal::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Literal::Int(i)),
                None => n.as_f64().map(Literal::Float),
            },
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    None
                } else if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    Some(Literal::Date(d))
                } else {
                    Some(Literal::Text(s.to_string()))
                }
            }
            Value::Array(a) if a.is_empty() => None,
            other => Some(Literal::Text(other.to_string())),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Literal::Text(s) => s.clone(),
            Literal::Int(i) => i.to_string(),
            Literal::Float(f) => f.to_string(),
            Literal::Bool(b) => b.to_string(),
            Literal::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    /// SQL 内联形式，统一加单引号
    pub fn sql_inline(&self) -> String {
        format!("'{}'", self.display().replace('\'', "''"))
    }

    pub fn pandas_repr(&self) -> String {
        match self {
            Literal::Int(_) | Literal::Float(_) => self.display(),
            Literal::Bool(true) => "True".to_string(),
            Literal::Bool(false) => "False".to_string(),
            _ => py_str(&self.display()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Literal::Text(s) => Value::String(s.clone()),
            Literal::Int(i) => Value::from(*i),
            Literal::Float(f) => Value::from(*f),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Date(_) => Value::String(self.display()),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(i) => Some(*i as f64),
            Literal::Float(f) => Some(*f),
            Literal::Text(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }
}

pub(crate) fn py_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
}

impl CompareOp {
    fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Gte => ">=",
            CompareOp::Lte => "<=",
        }
    }

    fn pandas(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            other => other.sql(),
        }
    }

    pub fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Gte => ord != Ordering::Less,
            CompareOp::Lte => ord != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    In {
        column: String,
        values: Vec<Literal>,
    },
    Contains {
        column: String,
        needle: String,
    },
    StartsWith {
        column: String,
        prefix: String,
    },
    And(Vec<Condition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sql,
    Pandas,
}

/// 构建器产出的带后端标签的表达式
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Sql(SqlFragment),
    Pandas(PandasExpr),
}

impl Expr {
    /// 审计/日志用的文本形式
    pub fn text(&self) -> String {
        match self {
            Expr::Sql(f) => f.to_inline(),
            Expr::Pandas(p) => p.0.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PandasExpr(pub String);

impl Condition {
    pub fn render(&self, backend: Backend) -> Expr {
        match backend {
            Backend::Sql => Expr::Sql(self.to_sql()),
            Backend::Pandas => Expr::Pandas(self.to_pandas()),
        }
    }

    pub fn to_sql(&self) -> SqlFragment {
        let mut f = SqlFragment::default();
        match self {
            Condition::Compare { column, op, value } => {
                f.raw(format!("{} {} ", column, op.sql()));
                f.param(value.clone());
            }
            Condition::In { column, values } => {
                f.raw(format!("{} IN (", column));
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.raw(", ");
                    }
                    f.param(v.clone());
                }
                f.raw(")");
            }
            Condition::Contains { column, needle } => {
                f.raw(format!("{} LIKE ", column));
                f.param(Literal::Text(format!("%{}%", like_escape(needle))));
                f.raw(LIKE_ESCAPE_CLAUSE);
            }
            Condition::StartsWith { column, prefix } => {
                f.raw(format!("{} LIKE ", column));
                f.param(Literal::Text(format!("{}%", like_escape(prefix))));
                f.raw(LIKE_ESCAPE_CLAUSE);
            }
            Condition::And(parts) => {
                for (i, c) in parts.iter().enumerate() {
                    if i > 0 {
                        f.raw(" AND ");
                    }
                    f.append(c.to_sql());
                }
            }
        }
        f
    }

    pub fn to_pandas(&self) -> PandasExpr {
        let text = match self {
            Condition::Compare { column, op, value } => {
                format!("df[{}] {} {}", py_str(column), op.pandas(), value.pandas_repr())
            }
            Condition::In { column, values } => {
                let items: Vec<String> = values.iter().map(|v| v.pandas_repr()).collect();
                format!("df[{}].isin([{}])", py_str(column), items.join(", "))
            }
            Condition::Contains { column, needle } => {
                format!("df[{}].str.contains({}, regex=False)", py_str(column), py_str(needle))
            }
            Condition::StartsWith { column, prefix } => {
                format!("df[{}].str.startswith({})", py_str(column), py_str(prefix))
            }
            Condition::And(parts) => parts
                .iter()
                .map(|c| format!("({})", c.to_pandas().0))
                .collect::<Vec<_>>()
                .join(" & "),
        };
        PandasExpr(text)
    }

    pub fn referenced_columns(&self) -> Vec<&str> {
        match self {
            Condition::Compare { column, .. }
            | Condition::In { column, .. }
            | Condition::Contains { column, .. }
            | Condition::StartsWith { column, .. } => vec![column.as_str()],
            Condition::And(parts) => parts.iter().flat_map(|c| c.referenced_columns()).collect(),
        }
    }

    /// 内存求值；null 单元格与 SQL 一致，任何比较都不成立
    pub fn matches(&self, columns: &[String], row: &[Value]) -> bool {
        match self {
            Condition::Compare { column, op, value } => {
                compare_cell(lookup(columns, row, column), value).is_some_and(|ord| op.accepts(ord))
            }
            Condition::In { column, values } => {
                let c = lookup(columns, row, column);
                values
                    .iter()
                    .any(|v| compare_cell(c, v) == Some(Ordering::Equal))
            }
            Condition::Contains { column, needle } => {
                cell_text(lookup(columns, row, column)).is_some_and(|s| s.contains(needle.as_str()))
            }
            Condition::StartsWith { column, prefix } => {
                cell_text(lookup(columns, row, column)).is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            Condition::And(parts) => parts.iter().all(|c| c.matches(columns, row)),
        }
    }
}

/// `!` 作转义符：Postgres 与 MySQL 字面量里都无需再转义
const LIKE_ESCAPE_CLAUSE: &str = " ESCAPE '!'";

/// 值中的 `%` `_` 按字面匹配
fn like_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '!' | '%' | '_') {
            out.push('!');
        }
        out.push(c);
    }
    out
}

static NULL: Value = Value::Null;

fn lookup<'a>(columns: &[String], row: &'a [Value], name: &str) -> &'a Value {
    columns
        .iter()
        .position(|c| c == name)
        .and_then(|i| row.get(i))
        .unwrap_or(&NULL)
}

pub(crate) fn cell_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn cell_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare_cell(cell: &Value, lit: &Literal) -> Option<Ordering> {
    if cell.is_null() {
        return None;
    }
    match lit {
        Literal::Date(d) => {
            let text = cell_text(cell)?;
            let head = text.get(..10).unwrap_or(&text);
            match NaiveDate::parse_from_str(head, "%Y-%m-%d") {
                Ok(cd) => Some(cd.cmp(d)),
                Err(_) => Some(text.as_str().cmp(lit.display().as_str())),
            }
        }
        Literal::Bool(b) => match cell {
            Value::Bool(cb) => Some(cb.cmp(b)),
            _ => Some(cell_text(cell)?.to_lowercase().as_str().cmp(b.to_string().as_str())),
        },
        _ => {
            let numeric = matches!(cell, Value::Number(_)) || matches!(lit, Literal::Int(_) | Literal::Float(_));
            if numeric {
                if let (Some(a), Some(b)) = (cell_f64(cell), lit.as_f64()) {
                    return a.partial_cmp(&b);
                }
            }
            Some(cell_text(cell)?.as_str().cmp(lit.display().as_str()))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlPart {
    Raw(String),
    Param(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
}

impl SqlDialect {
    fn placeholder(&self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", n),
            SqlDialect::MySql => "?".to_string(),
        }
    }
}

/// SQL 片段：原样文本与字面量分开保存，执行时走参数绑定
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    parts: Vec<SqlPart>,
}

impl SqlFragment {
    pub fn from_raw(s: impl Into<String>) -> Self {
        let mut f = Self::default();
        f.raw(s);
        f
    }

    pub fn raw(&mut self, s: impl Into<String>) {
        let s = s.into();
        if s.is_empty() {
            return;
        }
        if let Some(SqlPart::Raw(last)) = self.parts.last_mut() {
            last.push_str(&s);
        } else {
            self.parts.push(SqlPart::Raw(s));
        }
    }

    pub fn param(&mut self, lit: Literal) {
        self.parts.push(SqlPart::Param(lit));
    }

    pub fn append(&mut self, other: SqlFragment) {
        for part in other.parts {
            match part {
                SqlPart::Raw(s) => self.raw(s),
                SqlPart::Param(l) => self.param(l),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn params(&self) -> Vec<&Literal> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                SqlPart::Param(l) => Some(l),
                SqlPart::Raw(_) => None,
            })
            .collect()
    }

    /// 字面量内联后的完整文本，用于日志与审计
    pub fn to_inline(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                SqlPart::Raw(s) => s.clone(),
                SqlPart::Param(l) => l.sql_inline(),
            })
            .collect()
    }

    pub fn to_parameterized(&self, dialect: SqlDialect) -> (String, Vec<Literal>) {
        let mut sql = String::new();
        let mut binds = Vec::new();
        for part in &self.parts {
            match part {
                SqlPart::Raw(s) => sql.push_str(s),
                SqlPart::Param(l) => {
                    binds.push(l.clone());
                    sql.push_str(&dialect.placeholder(binds.len()));
                }
            }
        }
        (sql, binds)
    }
}
