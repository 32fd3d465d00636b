use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::core::compiler::{Compilation, CompiledQuery, FrameOp, QueryCompiler};
use crate::core::confidence;
use crate::core::formatter::format_output;
use crate::core::frame::apply_ops;
use crate::core::time_window::TimeWindowResolver;
use crate::core::transform::apply_transformations;
use crate::error::{EtlError, Result};
use crate::infra::catalog::DataSourceCatalog;
use crate::infra::db_external::{SqlConnector, SqlxConnector};
use crate::infra::file_reader::{LocalFileReader, TableReader};
use crate::models::datasource::DataSource;
use crate::models::instruction::{EtlInstruction, TaskConfig};
use crate::models::processed::ProcessedData;
use crate::models::table::Table;

/// 批量执行中的一项
#[derive(Debug, Clone)]
pub struct EtlJob {
    pub instruction: EtlInstruction,
    pub data_source_id: String,
    pub task_config: Option<TaskConfig>,
}

/// 指令执行器。目录、连接器、文件读取器均由外部注入；
/// 执行器本身无状态，每次调用独立建连并在返回前释放
pub struct EtlExecutor {
    catalog: Arc<dyn DataSourceCatalog>,
    connector: Arc<dyn SqlConnector>,
    reader: Arc<dyn TableReader>,
    config: EtlConfig,
}

impl EtlExecutor {
    pub fn new(
        catalog: Arc<dyn DataSourceCatalog>,
        connector: Arc<dyn SqlConnector>,
        reader: Arc<dyn TableReader>,
        config: EtlConfig,
    ) -> Self {
        Self {
            catalog,
            connector,
            reader,
            config,
        }
    }

    /// 默认装配：sqlx 连接器 + 本地文件读取器
    pub fn with_defaults(catalog: Arc<dyn DataSourceCatalog>, config: EtlConfig) -> Self {
        let connector = Arc::new(SqlxConnector::new(config.connect_timeout));
        let reader = Arc::new(LocalFileReader::new(config.csv_delimiter));
        Self::new(catalog, connector, reader, config)
    }

    /// 运行期故障一律转成失败结果返回；只有结构性非法的指令返回 Err
    #[instrument(skip(self, instruction, data_source_id, task_config), fields(instruction_id = %instruction.instruction_id, data_source_id = %data_source_id))]
    pub async fn execute_etl(
        &self,
        instruction: &EtlInstruction,
        data_source_id: &str,
        task_config: Option<&TaskConfig>,
    ) -> Result<ProcessedData> {
        let started = Instant::now();
        let mut meta = Map::new();
        meta.insert("instruction_id".into(), json!(instruction.instruction_id));
        meta.insert("data_source_id".into(), json!(data_source_id));
        meta.insert("execution_id".into(), json!(Uuid::new_v4().to_string()));
        meta.insert("output_format".into(), json!(instruction.output_format));

        instruction.validate()?;

        let source = match self.catalog.get(data_source_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!("数据源不存在: {}", data_source_id);
                let err = EtlError::DataSourceNotFound(data_source_id.to_string());
                return Ok(fail(meta, &err, String::new(), started));
            }
            Err(e) => {
                warn!("数据源目录查询失败: {}", e);
                return Ok(fail(meta, &e, String::new(), started));
            }
        };
        meta.insert("backend".into(), json!(source.source_type.as_str()));

        let compiler = QueryCompiler::new(
            TimeWindowResolver::from_clock(),
            self.config.default_table.clone(),
        );
        let compilation = match compiler.compile(instruction, &source, task_config) {
            Ok(c) => c,
            Err(e) if e.is_operational() => {
                warn!("指令编译失败: {}", e);
                return Ok(fail(meta, &e, String::new(), started));
            }
            Err(e) => return Err(e),
        };
        record_compilation(&mut meta, instruction, &compilation);
        let query_executed = compilation.query.describe();

        let (mut table, notes) = match self.run(&compilation.query, &source).await {
            Ok(r) => r,
            Err(e) => {
                warn!("执行失败: {}", e);
                return Ok(fail(meta, &e, query_executed, started));
            }
        };
        let rows_processed = table.len();

        let report = apply_transformations(&mut table, &instruction.transformations);
        meta.insert("transformations_applied".into(), json!(report.applied));
        if !report.errors.is_empty() {
            meta.insert("transformation_errors".into(), json!(report.errors));
        }
        if !notes.is_empty() {
            meta.insert("notes".into(), json!(notes));
        }

        let processed_value = format_output(&table, instruction.output_format);
        let confidence = confidence::score(instruction, &table, processed_value.as_ref());
        info!(
            "ETL 执行完成: {} 行, 置信度 {:.2}, 耗时 {:?}",
            rows_processed,
            confidence,
            started.elapsed()
        );

        Ok(ProcessedData {
            raw_data: table,
            processed_value,
            metadata: meta,
            processing_time: started.elapsed().as_secs_f64(),
            confidence,
            query_executed,
            rows_processed,
        })
    }

    /// 有界并发批量执行，结果顺序与输入一致
    pub async fn execute_batch(&self, jobs: &[EtlJob]) -> Vec<Result<ProcessedData>> {
        let width = self.config.max_concurrency.max(1);
        info!("批量执行 {} 条指令，并发上限 {}", jobs.len(), width);
        stream::iter(jobs.iter().map(|job| {
            self.execute_etl(&job.instruction, &job.data_source_id, job.task_config.as_ref())
        }))
        .buffered(width)
        .collect()
        .await
    }

    async fn run(&self, query: &CompiledQuery, source: &DataSource) -> Result<(Table, Vec<String>)> {
        match query {
            CompiledQuery::Sql(q) => {
                let conn = source
                    .connection_string
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        EtlError::InvalidDataSource(format!(
                            "data source {} has no connection string",
                            source.id
                        ))
                    })?;
                let table = self.connector.fetch(conn, q).await?;
                Ok((table, Vec::new()))
            }
            CompiledQuery::Frame(ops) => {
                let Some(FrameOp::Load { kind, path }) = ops.first() else {
                    return Err(EtlError::InvalidDataSource(
                        "frame pipeline does not start with a load".into(),
                    ));
                };
                let (kind, path) = (*kind, path.clone());
                let reader = Arc::clone(&self.reader);
                let table = tokio::task::spawn_blocking(move || reader.read(kind, &path))
                    .await
                    .map_err(|e| EtlError::Io(std::io::Error::other(e.to_string())))??;
                apply_ops(table, ops)
            }
        }
    }
}

fn record_compilation(meta: &mut Map<String, Value>, instruction: &EtlInstruction, c: &Compilation) {
    match &c.query {
        CompiledQuery::Sql(q) => {
            meta.insert("query".into(), json!(q.text()));
        }
        CompiledQuery::Frame(ops) => {
            let described: Vec<String> = ops.iter().map(FrameOp::describe).collect();
            meta.insert("operations".into(), json!(described));
        }
    }
    meta.insert(
        "filters_applied".into(),
        json!(instruction.filters.len() - c.skipped_filters.len()),
    );
    if !c.skipped_filters.is_empty() {
        meta.insert("skipped_filters".into(), json!(c.skipped_filters));
    }
    meta.insert("aggregations_applied".into(), json!(instruction.aggregations.len()));
    if let Some(w) = &c.time_window {
        meta.insert("time_window".into(), json!(w));
    }
    if let Some(period) = instruction.time_config.as_ref().and_then(|t| t.period.as_ref()) {
        meta.insert("period".into(), json!(period));
    }
    if let Some(level) = instruction
        .region_config
        .as_ref()
        .and_then(|r| r.region_level.as_ref())
    {
        meta.insert("region_level".into(), json!(level));
    }
}

fn fail(meta: Map<String, Value>, err: &EtlError, query: String, started: Instant) -> ProcessedData {
    ProcessedData::failure(meta, err.to_string(), query, started.elapsed().as_secs_f64())
}
