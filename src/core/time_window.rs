use chrono::{Datelike, Duration, Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::expr::{CompareOp, Condition, Literal};
use crate::core::filter::is_identifier;
use crate::models::instruction::{TaskConfig, TimeConfig};

/// 时间窗口来源，按优先级从高到低
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    TaskOverride,
    Explicit,
    Relative(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub field: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub source: WindowSource,
}

impl TimeWindow {
    /// `field >= start AND field <= end`，缺失的一端省略
    pub fn condition(&self) -> Option<Condition> {
        let mut parts = Vec::new();
        if let Some(start) = &self.start_date {
            parts.push(Condition::Compare {
                column: self.field.clone(),
                op: CompareOp::Gte,
                value: date_literal(start),
            });
        }
        if let Some(end) = &self.end_date {
            parts.push(Condition::Compare {
                column: self.field.clone(),
                op: CompareOp::Lte,
                value: date_literal(end),
            });
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Condition::And(parts)),
        }
    }
}

fn date_literal(raw: &str) -> Literal {
    match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Ok(d) => Literal::Date(d),
        Err(_) => Literal::Text(raw.to_string()),
    }
}

fn non_empty(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn fmt(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// 解析时间配置；相对周期以 `today` 为基准计算
#[derive(Debug, Clone, Copy)]
pub struct TimeWindowResolver {
    today: NaiveDate,
}

impl TimeWindowResolver {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn from_clock() -> Self {
        Self::new(Local::now().date_naive())
    }

    /// 优先级：任务覆盖 > 显式起止 > 相对周期 > 不过滤
    pub fn resolve(&self, cfg: &TimeConfig, task: Option<&TaskConfig>) -> Option<TimeWindow> {
        let field = cfg.field.trim();
        if field.is_empty() || !is_identifier(field) {
            warn!("时间字段为空或非法，跳过时间过滤: {:?}", field);
            return None;
        }
        let field = field.to_string();

        if let Some(range) = task.and_then(|t| t.time_range.as_ref()) {
            let (start, end) = (non_empty(&range.start_date), non_empty(&range.end_date));
            if start.is_some() || end.is_some() {
                debug!("使用任务级时间覆盖: {:?} ~ {:?}", start, end);
                return Some(TimeWindow {
                    field,
                    start_date: start,
                    end_date: end,
                    source: WindowSource::TaskOverride,
                });
            }
        }

        let (start, end) = (non_empty(&cfg.start_date), non_empty(&cfg.end_date));
        if start.is_some() || end.is_some() {
            return Some(TimeWindow {
                field,
                start_date: start,
                end_date: end,
                source: WindowSource::Explicit,
            });
        }

        let keyword = non_empty(&cfg.relative_period)?;
        match self.relative_range(&keyword) {
            Some((s, e)) => Some(TimeWindow {
                field,
                start_date: Some(fmt(s)),
                end_date: Some(fmt(e)),
                source: WindowSource::Relative(keyword),
            }),
            None => {
                warn!("不支持的相对时间周期: {}，不加时间过滤", keyword);
                None
            }
        }
    }

    pub fn relative_range(&self, keyword: &str) -> Option<(NaiveDate, NaiveDate)> {
        let t = self.today;
        let range = match keyword.trim().to_lowercase().as_str() {
            "today" => (t, t),
            "yesterday" => {
                let y = t - Duration::days(1);
                (y, y)
            }
            "this_week" => {
                let monday = t - Duration::days(t.weekday().num_days_from_monday() as i64);
                (monday, monday + Duration::days(6))
            }
            "last_week" => {
                let monday = t - Duration::days(t.weekday().num_days_from_monday() as i64 + 7);
                (monday, monday + Duration::days(6))
            }
            "last_7_days" => (t - Duration::days(6), t),
            "last_30_days" => (t - Duration::days(29), t),
            "this_month" => month_range(t.year(), t.month())?,
            "last_month" => {
                let (y, m) = if t.month() == 1 {
                    (t.year() - 1, 12)
                } else {
                    (t.year(), t.month() - 1)
                };
                month_range(y, m)?
            }
            "this_quarter" => quarter_range(t.year(), (t.month() - 1) / 3)?,
            "last_quarter" => {
                let q = (t.month() - 1) / 3;
                if q == 0 {
                    quarter_range(t.year() - 1, 3)?
                } else {
                    quarter_range(t.year(), q - 1)?
                }
            }
            "this_year" => year_range(t.year())?,
            "last_year" => year_range(t.year() - 1)?,
            _ => return None,
        };
        Some(range)
    }
}

fn month_range(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next - Duration::days(1)))
}

fn quarter_range(year: i32, quarter: u32) -> Option<(NaiveDate, NaiveDate)> {
    let (start, _) = month_range(year, quarter * 3 + 1)?;
    let (_, end) = month_range(year, quarter * 3 + 3)?;
    Some((start, end))
}

fn year_range(year: i32) -> Option<(NaiveDate, NaiveDate)> {
    Some((
        NaiveDate::from_ymd_opt(year, 1, 1)?,
        NaiveDate::from_ymd_opt(year, 12, 31)?,
    ))
}
