use crate::models::instruction::EtlInstruction;
use crate::models::processed::ProcessedValue;
use crate::models::table::Table;

const EMPTY_SCORE: f64 = 0.1;
const NULL_WEIGHT: f64 = 0.6;
const COMPLEXITY_STEP: f64 = 0.02;
const COMPLEXITY_CAP: f64 = 0.15;

/// 启发式置信度：空表低分，空值越多越低，指令越复杂略降
pub fn score(instruction: &EtlInstruction, table: &Table, value: Option<&ProcessedValue>) -> f64 {
    if table.is_empty() || table.cell_count() == 0 {
        return EMPTY_SCORE;
    }

    let null_ratio = table.null_count() as f64 / table.cell_count() as f64;
    let mut s = 1.0 - NULL_WEIGHT * null_ratio;

    let complexity = instruction.filters.len()
        + instruction.aggregations.len()
        + instruction.transformations.len();
    s -= (complexity as f64 * COMPLEXITY_STEP).min(COMPLEXITY_CAP);

    match value {
        None => s *= 0.5,
        Some(v) if v.is_null() => s *= 0.5,
        _ => {}
    }
    s.clamp(0.0, 1.0)
}
