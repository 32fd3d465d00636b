use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::expr::{cell_f64, cell_text};
use crate::error::{EtlError, Result};
use crate::models::instruction::{CastType, Transformation};
use crate::models::table::Table;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TransformReport {
    pub applied: usize,
    /// 失败被跳过的步骤说明
    pub errors: Vec<String>,
}

/// 按声明顺序执行转换；单步失败只跳过该步
pub fn apply_transformations(table: &mut Table, transformations: &[Transformation]) -> TransformReport {
    let mut report = TransformReport::default();
    for (i, t) in transformations.iter().enumerate() {
        match apply_one(table, t) {
            Ok(()) => {
                report.applied += 1;
                debug!("转换 #{} ({}) 完成", i, t.kind());
            }
            Err(e) => {
                warn!("转换 #{} ({}) 失败，已跳过: {}", i, t.kind(), e);
                report.errors.push(format!("transformation #{} ({}) skipped: {}", i, t.kind(), e));
            }
        }
    }
    report
}

pub fn apply_one(table: &mut Table, t: &Transformation) -> Result<()> {
    match t {
        Transformation::Cast { field, target_type } => {
            let idx = table.require_column(field)?;
            for row in table.rows.iter_mut() {
                row[idx] = cast_value(&row[idx], *target_type);
            }
        }
        Transformation::Format {
            field,
            format_string,
        } => {
            if !format_string.contains("{}") {
                return Err(EtlError::Transformation(format!(
                    "format string {:?} has no {{}} placeholder",
                    format_string
                )));
            }
            let idx = table.require_column(field)?;
            for row in table.rows.iter_mut() {
                if let Some(text) = cell_text(&row[idx]) {
                    row[idx] = Value::String(format_string.replacen("{}", &text, 1));
                }
            }
        }
        Transformation::Calculate {
            formula,
            target_field,
        } => {
            let target = target_field.trim();
            if target.is_empty() {
                return Err(EtlError::Transformation("calculate has no target_field".into()));
            }
            let expr = Formula::parse(formula)?;
            for col in expr.columns() {
                table.require_column(col)?;
            }
            let values: Vec<Value> = table
                .rows
                .iter()
                .map(|row| {
                    expr.eval(&table.columns, row)
                        .map(Value::from)
                        .unwrap_or(Value::Null)
                })
                .collect();
            table.set_column(target, values);
        }
    }
    Ok(())
}

/// 类型转换，失败置 null 而不是报错
pub fn cast_value(v: &Value, target: CastType) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    match target {
        CastType::Int => match v {
            Value::Number(n) => n
                .as_i64()
                .map(Value::from)
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| Value::from(f.trunc() as i64)))
                .unwrap_or(Value::Null),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .map(|f| Value::from(f.trunc() as i64))
                    })
                    .unwrap_or(Value::Null)
            }
            Value::Bool(b) => Value::from(*b as i64),
            _ => Value::Null,
        },
        CastType::Float => cell_f64(v)
            .filter(|f| f.is_finite())
            .map(Value::from)
            .unwrap_or(Value::Null),
        CastType::Str => cell_text(v).map(Value::String).unwrap_or(Value::Null),
        CastType::Bool => match v {
            Value::Bool(b) => Value::Bool(*b),
            Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "是" => Value::Bool(true),
                "false" | "0" | "no" | "n" | "否" => Value::Bool(false),
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        CastType::Date => {
            let Some(text) = cell_text(v) else {
                return Value::Null;
            };
            let text = text.trim();
            let head = text.get(..10).unwrap_or(text);
            ["%Y-%m-%d", "%Y/%m/%d"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
                .or_else(|| NaiveDate::parse_from_str(text, "%Y%m%d").ok())
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null)
        }
    }
}

/// 计算公式：列名、数字、`+ - * /` 与括号
#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    Num(f64),
    Col(String),
    Neg(Box<Formula>),
    Bin(char, Box<Formula>, Box<Formula>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| EtlError::Transformation(format!("bad number {:?} in formula", text)))?;
            tokens.push(Token::Num(n));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            tokens.push(match c {
                '+' | '-' | '*' | '/' => Token::Op(c),
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(EtlError::Transformation(format!(
                        "unexpected character {:?} in formula",
                        other
                    )))
                }
            });
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Formula> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Formula::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Formula> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Formula::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Formula> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Formula::Num(n)),
            Some(Token::Ident(name)) => Ok(Formula::Col(name)),
            Some(Token::Op('-')) => Ok(Formula::Neg(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EtlError::Transformation("unbalanced parenthesis in formula".into())),
                }
            }
            other => Err(EtlError::Transformation(format!(
                "unexpected token {:?} in formula",
                other
            ))),
        }
    }
}

impl Formula {
    pub fn parse(src: &str) -> Result<Formula> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(EtlError::Transformation("empty formula".into()));
        }
        let mut p = Parser { tokens, pos: 0 };
        let f = p.expr()?;
        if p.pos != p.tokens.len() {
            return Err(EtlError::Transformation(format!(
                "trailing tokens in formula {:?}",
                src
            )));
        }
        Ok(f)
    }

    pub fn columns(&self) -> Vec<&str> {
        match self {
            Formula::Num(_) => Vec::new(),
            Formula::Col(c) => vec![c.as_str()],
            Formula::Neg(inner) => inner.columns(),
            Formula::Bin(_, a, b) => {
                let mut v = a.columns();
                v.extend(b.columns());
                v
            }
        }
    }

    /// 任一操作数缺失/非数值或除零时返回 None
    pub fn eval(&self, columns: &[String], row: &[Value]) -> Option<f64> {
        let out = match self {
            Formula::Num(n) => *n,
            Formula::Col(c) => {
                let idx = columns.iter().position(|x| x == c)?;
                cell_f64(row.get(idx)?)?
            }
            Formula::Neg(inner) => -inner.eval(columns, row)?,
            Formula::Bin(op, a, b) => {
                let (a, b) = (a.eval(columns, row)?, b.eval(columns, row)?);
                match op {
                    '+' => a + b,
                    '-' => a - b,
                    '*' => a * b,
                    _ => {
                        if b == 0.0 {
                            return None;
                        }
                        a / b
                    }
                }
            }
        };
        out.is_finite().then_some(out)
    }
}
