use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EtlError, Result};

/// 与后端无关的二维表：列名有序，行按列顺序存放
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// 由 JSON 记录构建，列顺序取首次出现的顺序，缺失单元补 null
    pub fn from_records(records: &[Value]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for rec in records {
            if let Value::Object(map) = rec {
                for key in map.keys() {
                    if !columns.iter().any(|c| c == key) {
                        columns.push(key.clone());
                    }
                }
            }
        }
        let rows = records
            .iter()
            .map(|rec| {
                columns
                    .iter()
                    .map(|c| rec.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| EtlError::MissingColumn(name.to_string()))
    }

    pub fn cell_count(&self) -> usize {
        self.rows.len() * self.columns.len()
    }

    pub fn null_count(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|r| r.iter())
            .filter(|v| v.is_null())
            .count()
    }

    pub fn row_record(&self, idx: usize) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(row) = self.rows.get(idx) {
            for (col, val) in self.columns.iter().zip(row.iter()) {
                map.insert(col.clone(), val.clone());
            }
        }
        map
    }

    pub fn to_records(&self) -> Vec<Map<String, Value>> {
        (0..self.rows.len()).map(|i| self.row_record(i)).collect()
    }

    /// 列投影，列不存在时报错
    pub fn select(&self, columns: &[String]) -> Result<Table> {
        let idx = columns
            .iter()
            .map(|c| self.require_column(c))
            .collect::<Result<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|r| idx.iter().map(|&i| r[i].clone()).collect())
            .collect();
        Ok(Table {
            columns: columns.to_vec(),
            rows,
        })
    }

    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&[Value]) -> bool,
    {
        self.rows.retain(|r| keep(r));
    }

    /// 新增或覆盖一列
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        match self.column_index(name) {
            Some(idx) => {
                for (row, v) in self.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                self.columns.push(name.to_string());
                let mut values = values.into_iter();
                for row in self.rows.iter_mut() {
                    row.push(values.next().unwrap_or(Value::Null));
                }
            }
        }
    }
}
