use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use report_etl::infra::catalog::{DataSourceCatalog, InMemoryCatalog};
use report_etl::infra::db_internal::PgCatalog;
use report_etl::{EtlConfig, EtlExecutor, EtlInstruction, EtlJob, TaskConfig};

#[derive(Parser, Debug)]
#[command(name = "etl-runner", about = "执行报表 ETL 指令并输出 ProcessedData")]
struct Cli {
    /// 指令 JSON 文件，对象为单条，数组为批量
    #[arg(long)]
    instruction: PathBuf,

    #[arg(long = "source-id")]
    source_id: String,

    /// 任务配置 JSON，time_range 会覆盖指令中的时间窗口
    #[arg(long = "task-config")]
    task_config: Option<PathBuf>,

    /// 数据源目录 JSON；缺省时连接 DATABASE_URL 读取 data_sources 表
    #[arg(long)]
    sources: Option<PathBuf>,
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("读取 {} 失败", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("解析 {} 失败", path.display()))
}

async fn open_catalog(cli: &Cli, config: &EtlConfig) -> anyhow::Result<Arc<dyn DataSourceCatalog>> {
    if let Some(path) = &cli.sources {
        return Ok(Arc::new(InMemoryCatalog::from_json_file(path)?));
    }
    let Some(url) = config.catalog_database_url.as_deref() else {
        bail!("未提供 --sources，且 DATABASE_URL 未设置");
    };
    Ok(Arc::new(PgCatalog::connect(url).await?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_env()?;
    let catalog = open_catalog(&cli, &config).await?;
    let executor = EtlExecutor::with_defaults(catalog, config);

    let task_config: Option<TaskConfig> = match &cli.task_config {
        Some(p) => Some(serde_json::from_value(read_json(p)?)?),
        None => None,
    };

    let output = match read_json(&cli.instruction)? {
        Value::Array(items) => {
            let jobs = items
                .into_iter()
                .map(|v| {
                    Ok(EtlJob {
                        instruction: serde_json::from_value(v)?,
                        data_source_id: cli.source_id.clone(),
                        task_config: task_config.clone(),
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            info!("批量模式: {} 条指令", jobs.len());
            let results = executor.execute_batch(&jobs).await;
            Value::Array(
                results
                    .into_iter()
                    .map(|r| match r {
                        Ok(data) => serde_json::to_value(data),
                        Err(e) => Ok(json!({ "error": e.to_string() })),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            )
        }
        v => {
            let instruction: EtlInstruction = serde_json::from_value(v)?;
            let data = executor
                .execute_etl(&instruction, &cli.source_id, task_config.as_ref())
                .await?;
            serde_json::to_value(data)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
