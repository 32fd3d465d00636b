use tracing::warn;

use crate::core::expr::{Backend, CompareOp, Condition, Literal};
use crate::core::filter::is_identifier;
use crate::models::instruction::{RegionConfig, RegionType};

/// 地区条件；地区值为空时不生成条件
pub fn build_region_condition(cfg: &RegionConfig) -> Option<Condition> {
    let value = cfg.region_value.trim();
    let field = cfg.field.trim();
    if value.is_empty() || field.is_empty() {
        return None;
    }
    if !is_identifier(field) {
        warn!("忽略非法地区字段: {:?}", field);
        return None;
    }
    let column = field.to_string();
    Some(match cfg.region_type {
        RegionType::Exact => Condition::Compare {
            column,
            op: CompareOp::Eq,
            value: Literal::Text(value.to_string()),
        },
        RegionType::Contains => Condition::Contains {
            column,
            needle: value.to_string(),
        },
        RegionType::StartsWith => Condition::StartsWith {
            column,
            prefix: value.to_string(),
        },
    })
}

pub fn build_region(cfg: &RegionConfig, backend: Backend) -> String {
    build_region_condition(cfg)
        .map(|c| c.render(backend).text())
        .unwrap_or_default()
}
