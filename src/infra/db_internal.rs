use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use tracing::debug;

use crate::error::{EtlError, Result};
use crate::infra::catalog::DataSourceCatalog;
use crate::models::datasource::{BackendKind, DataSource};

/// 元数据库中的 data_sources 表
pub struct PgCatalog {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct DataSourceRow {
    id: String,
    source_type: String,
    connection_string: Option<String>,
    file_path: Option<String>,
    wide_table_name: Option<String>,
    table_name: Option<String>,
    display_name: Option<String>,
}

impl DataSourceRow {
    fn into_descriptor(self) -> Result<DataSource> {
        let source_type = BackendKind::try_from(self.source_type).map_err(EtlError::Catalog)?;
        Ok(DataSource {
            id: self.id,
            display_name: self.display_name,
            source_type,
            connection_string: self.connection_string,
            file_path: self.file_path,
            wide_table_name: self.wide_table_name,
            table_name: self.table_name,
        })
    }
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| EtlError::Catalog(format!("failed to open catalog database: {}", e)))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataSourceCatalog for PgCatalog {
    async fn get(&self, id: &str) -> Result<Option<DataSource>> {
        let row = sqlx::query_as::<_, DataSourceRow>(
            "SELECT id, source_type, connection_string, file_path, wide_table_name, table_name, display_name
             FROM data_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EtlError::Catalog(e.to_string()))?;
        debug!("目录查询 {} -> {}", id, row.is_some());
        row.map(DataSourceRow::into_descriptor).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_with_unknown_type_is_a_catalog_error() {
        let row = DataSourceRow {
            id: "x".into(),
            source_type: "excel".into(),
            connection_string: None,
            file_path: None,
            wide_table_name: None,
            table_name: None,
            display_name: None,
        };
        assert!(matches!(row.into_descriptor(), Err(EtlError::Catalog(_))));
    }

    #[test]
    fn row_maps_to_descriptor() {
        let row = DataSourceRow {
            id: "pg".into(),
            source_type: "postgresql".into(),
            connection_string: Some("postgres://h/db".into()),
            file_path: None,
            wide_table_name: Some("wide".into()),
            table_name: None,
            display_name: Some("报表库".into()),
        };
        let ds = row.into_descriptor().unwrap();
        assert_eq!(ds.source_type, BackendKind::Sql);
        assert_eq!(ds.target_table(None), Some("wide"));
    }
}
