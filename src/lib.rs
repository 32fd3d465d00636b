//! 报表 ETL 指令执行：把结构化指令编译为 SQL 或内存表操作，
//! 执行后经转换、格式化、置信度评估，产出 ProcessedData。

pub mod config;
pub mod core;
pub mod error;
pub mod infra;
pub mod models;

pub use crate::config::EtlConfig;
pub use crate::core::executor::{EtlExecutor, EtlJob};
pub use crate::error::{EtlError, Result};
pub use crate::models::instruction::{EtlInstruction, TaskConfig};
pub use crate::models::processed::{ProcessedData, ProcessedValue};
