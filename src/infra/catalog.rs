use async_trait::async_trait;
use dashmap::DashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::models::datasource::DataSource;

/// 数据源目录：按 id 查找描述，找不到返回 None
#[async_trait]
pub trait DataSourceCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<DataSource>>;
}

#[derive(Default)]
pub struct InMemoryCatalog {
    sources: DashMap<String, DataSource>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: impl IntoIterator<Item = DataSource>) -> Self {
        let catalog = Self::new();
        for s in sources {
            catalog.insert(s);
        }
        catalog
    }

    /// 从 JSON 数组文件加载
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let sources: Vec<DataSource> = serde_json::from_str(&raw)?;
        info!("从 {} 加载 {} 个数据源", path.as_ref().display(), sources.len());
        Ok(Self::with_sources(sources))
    }

    pub fn insert(&self, source: DataSource) {
        self.sources.insert(source.id.clone(), source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl DataSourceCatalog for InMemoryCatalog {
    async fn get(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.sources.get(id).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::datasource::BackendKind;

    #[tokio::test]
    async fn lookup_hits_and_misses() {
        let catalog = InMemoryCatalog::with_sources([DataSource {
            id: "ds1".into(),
            display_name: Some("投诉库".into()),
            source_type: BackendKind::Csv,
            connection_string: None,
            file_path: Some("/tmp/a.csv".into()),
            wide_table_name: None,
            table_name: None,
        }]);
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("ds1").await.unwrap().is_some());
        assert!(catalog.get("nope").await.unwrap().is_none());
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        fs::write(
            &path,
            r#"[{"id": "pg", "source_type": "postgres", "connection_string": "postgres://x/y", "wide_table_name": "w"},
                {"id": "f", "source_type": "file", "file_path": "/data/a.csv"}]"#,
        )
        .unwrap();
        let catalog = InMemoryCatalog::from_json_file(&path).unwrap();
        assert_eq!(catalog.len(), 2);
    }
}
