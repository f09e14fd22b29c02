//! CozoDB handle shared by the attribution and strategy stores
//!
//! Relations are declared once as [`RelationDef`]s; every read and write
//! goes through `$name` parameters, and a consumer batch is committed as a
//! single chained script so it lands in one transaction.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use cozo::{DataValue, DbInstance, NamedRows, Num, ScriptMutability};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GrooveError, Result};

/// Storage engine backing the database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEngine {
    /// Process-local, lost on exit
    #[default]
    Mem,
    /// On-disk RocksDB (requires the `rocksdb` feature)
    Rocksdb,
}

/// `[store]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub engine: StoreEngine,
    /// Database path; defaults to `<data_dir>/groove/engine.db`
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("groove")
                .join("engine.db")
        })
    }
}

/// A relation: name plus typed key and value columns
#[derive(Debug)]
pub struct RelationDef {
    pub name: &'static str,
    pub keys: &'static [(&'static str, &'static str)],
    pub values: &'static [(&'static str, &'static str)],
}

impl RelationDef {
    fn key_names(&self) -> Vec<&'static str> {
        self.keys.iter().map(|(n, _)| *n).collect()
    }

    fn value_names(&self) -> Vec<&'static str> {
        self.values.iter().map(|(n, _)| *n).collect()
    }

    /// All column names, keys first, comma-separated
    pub fn columns(&self) -> String {
        let mut cols = self.key_names();
        cols.extend(self.value_names());
        cols.join(", ")
    }

    fn create_script(&self) -> String {
        let typed = |cols: &[(&str, &str)]| {
            cols.iter()
                .map(|(n, t)| format!("{n}: {t}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            ":create {} {{ {} => {} }}",
            self.name,
            typed(self.keys),
            typed(self.values)
        )
    }

    fn write_clause(&self, op: &str) -> String {
        format!(
            ":{op} {} {{ {} => {} }}",
            self.name,
            self.key_names().join(", "),
            self.value_names().join(", ")
        )
    }

    fn rm_clause(&self) -> String {
        format!(":rm {} {{ {} }}", self.name, self.key_names().join(", "))
    }

    /// `?[cols] := *rel{cols}` followed by optional filter conditions
    pub fn select(&self, conditions: &str) -> String {
        let cols = self.columns();
        if conditions.is_empty() {
            format!("?[{cols}] := *{}{{{cols}}}", self.name)
        } else {
            format!("?[{cols}] := *{}{{{cols}}}, {conditions}", self.name)
        }
    }
}

/// Write operations collected for one atomic commit
#[derive(Debug, Default)]
pub struct ScriptBatch {
    blocks: Vec<String>,
    params: BTreeMap<String, DataValue>,
}

impl ScriptBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Upsert rows (full column order: keys then values)
    pub fn put(&mut self, rel: &RelationDef, rows: Vec<Vec<DataValue>>) {
        self.push(&rel.columns(), rel.write_clause("put"), rows);
    }

    /// Insert rows; fails the whole batch if any key already exists
    pub fn insert(&mut self, rel: &RelationDef, rows: Vec<Vec<DataValue>>) {
        self.push(&rel.columns(), rel.write_clause("insert"), rows);
    }

    /// Remove rows by key
    pub fn remove(&mut self, rel: &RelationDef, keys: Vec<Vec<DataValue>>) {
        self.push(&rel.key_names().join(", "), rel.rm_clause(), keys);
    }

    /// Append all operations of another batch
    pub fn extend(&mut self, other: ScriptBatch) {
        let offset = self.params.len();
        for (i, block) in other.blocks.into_iter().enumerate() {
            let from = format!("${}", param_name(i));
            let to = format!("${}", param_name(offset + i));
            self.blocks.push(block.replacen(&from, &to, 1));
        }
        for (i, (_, rows)) in other.params.into_iter().enumerate() {
            self.params.insert(param_name(offset + i), rows);
        }
    }

    fn push(&mut self, head: &str, clause: String, rows: Vec<Vec<DataValue>>) {
        if rows.is_empty() {
            return;
        }
        let param = param_name(self.params.len());
        self.blocks.push(format!("{{ ?[{head}] <- ${param} {clause} }}"));
        self.params
            .insert(param, DataValue::List(rows.into_iter().map(DataValue::List).collect()));
    }

    fn into_script(self) -> (String, BTreeMap<String, DataValue>) {
        (self.blocks.join("\n"), self.params)
    }
}

fn param_name(i: usize) -> String {
    // fixed width keeps names prefix-free and BTreeMap order equal to block order
    format!("rows_{i:06}")
}

/// Shared database handle
#[derive(Clone)]
pub struct GrooveDb {
    db: Arc<DbInstance>,
}

impl std::fmt::Debug for GrooveDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrooveDb").finish_non_exhaustive()
    }
}

impl GrooveDb {
    /// Open an in-memory database
    pub fn open_mem() -> Result<Self> {
        let db = DbInstance::new("mem", "", "")
            .map_err(|e| GrooveError::Database(format!("Failed to open database: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open or create an on-disk database
    #[cfg(feature = "rocksdb")]
    pub fn open_rocksdb(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GrooveError::Database(format!("Failed to create directory: {e}")))?;
        }
        let db = DbInstance::new("rocksdb", path, "")
            .map_err(|e| GrooveError::Database(format!("Failed to open database: {e}")))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open according to the `[store]` section
    pub fn open(config: &StoreConfig) -> Result<Self> {
        match config.engine {
            StoreEngine::Mem => Self::open_mem(),
            #[cfg(feature = "rocksdb")]
            StoreEngine::Rocksdb => Self::open_rocksdb(&config.resolved_path()),
            #[cfg(not(feature = "rocksdb"))]
            StoreEngine::Rocksdb => Err(GrooveError::Config(
                "store.engine = \"rocksdb\" requires the rocksdb feature".into(),
            )),
        }
    }

    /// Create any relations that do not exist yet
    pub fn ensure_relations(&self, relations: &[&RelationDef]) -> Result<()> {
        let existing: HashSet<String> = self
            .run_query("::relations", BTreeMap::new())?
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.get_str()).map(str::to_owned))
            .collect();

        for rel in relations.iter().filter(|r| !existing.contains(r.name)) {
            debug!(relation = rel.name, "Creating relation");
            self.run_mutation(&rel.create_script(), BTreeMap::new())
                .map_err(|e| GrooveError::Database(format!("Schema init failed: {e}")))?;
        }
        Ok(())
    }

    /// Run a read-only query
    pub fn run_query(&self, query: &str, params: BTreeMap<String, DataValue>) -> Result<NamedRows> {
        self.db
            .run_script(query, params, ScriptMutability::Immutable)
            .map_err(|e| GrooveError::Database(format!("Query failed: {e}")))
    }

    /// Run a mutation
    pub fn run_mutation(
        &self,
        query: &str,
        params: BTreeMap<String, DataValue>,
    ) -> Result<NamedRows> {
        self.db
            .run_script(query, params, ScriptMutability::Mutable)
            .map_err(|e| GrooveError::Database(format!("Mutation failed: {e}")))
    }

    /// Commit a batch as one transaction
    pub fn commit(&self, batch: ScriptBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let blocks = batch.len();
        let (script, params) = batch.into_script();
        self.run_mutation(&script, params)?;
        debug!(blocks, "Committed batch");
        Ok(())
    }
}

/// Single named parameter
pub fn params1(name: &str, value: DataValue) -> BTreeMap<String, DataValue> {
    BTreeMap::from([(name.to_string(), value)])
}

// ---- value construction -------------------------------------------------

pub fn dv_str(s: impl AsRef<str>) -> DataValue {
    DataValue::Str(s.as_ref().into())
}

pub fn dv_int(v: i64) -> DataValue {
    DataValue::Num(Num::Int(v))
}

pub fn dv_float(v: f64) -> DataValue {
    DataValue::Num(Num::Float(v))
}

pub fn dv_bool(v: bool) -> DataValue {
    DataValue::Bool(v)
}

pub fn dv_opt_float(v: Option<f64>) -> DataValue {
    v.map_or(DataValue::Null, dv_float)
}

pub fn dv_opt_str(v: Option<&str>) -> DataValue {
    v.map_or(DataValue::Null, dv_str)
}

pub fn dv_time(t: DateTime<Utc>) -> DataValue {
    dv_int(t.timestamp_millis())
}

// ---- row access ---------------------------------------------------------

fn cell<'a>(row: &'a [DataValue], idx: usize, col: &str) -> Result<&'a DataValue> {
    row.get(idx)
        .ok_or_else(|| GrooveError::Database(format!("Missing column {col}")))
}

pub fn get_str(row: &[DataValue], idx: usize, col: &str) -> Result<String> {
    cell(row, idx, col)?
        .get_str()
        .map(str::to_owned)
        .ok_or_else(|| GrooveError::Database(format!("Invalid {col}")))
}

pub fn get_opt_str(row: &[DataValue], idx: usize, col: &str) -> Result<Option<String>> {
    match cell(row, idx, col)? {
        DataValue::Null => Ok(None),
        v => v
            .get_str()
            .map(|s| Some(s.to_owned()))
            .ok_or_else(|| GrooveError::Database(format!("Invalid {col}"))),
    }
}

pub fn get_int(row: &[DataValue], idx: usize, col: &str) -> Result<i64> {
    cell(row, idx, col)?
        .get_int()
        .ok_or_else(|| GrooveError::Database(format!("Invalid {col}")))
}

pub fn get_float(row: &[DataValue], idx: usize, col: &str) -> Result<f64> {
    cell(row, idx, col)?
        .get_float()
        .ok_or_else(|| GrooveError::Database(format!("Invalid {col}")))
}

pub fn get_opt_float(row: &[DataValue], idx: usize, col: &str) -> Result<Option<f64>> {
    match cell(row, idx, col)? {
        DataValue::Null => Ok(None),
        v => v
            .get_float()
            .map(Some)
            .ok_or_else(|| GrooveError::Database(format!("Invalid {col}"))),
    }
}

pub fn get_bool(row: &[DataValue], idx: usize, col: &str) -> Result<bool> {
    cell(row, idx, col)?
        .get_bool()
        .ok_or_else(|| GrooveError::Database(format!("Invalid {col}")))
}

pub fn get_time(row: &[DataValue], idx: usize, col: &str) -> Result<DateTime<Utc>> {
    let millis = get_int(row, idx, col)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| GrooveError::Database(format!("Invalid timestamp in {col}")))
}

pub fn get_uuid(row: &[DataValue], idx: usize, col: &str) -> Result<uuid::Uuid> {
    let s = get_str(row, idx, col)?;
    uuid::Uuid::parse_str(&s).map_err(|e| GrooveError::Database(format!("Invalid {col}: {e}")))
}

pub fn get_json<T: serde::de::DeserializeOwned>(
    row: &[DataValue],
    idx: usize,
    col: &str,
) -> Result<T> {
    let s = get_str(row, idx, col)?;
    Ok(serde_json::from_str(&s)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET: RelationDef = RelationDef {
        name: "widget",
        keys: &[("id", "String")],
        values: &[("size", "Int"), ("weight", "Float?")],
    };

    fn db() -> GrooveDb {
        let db = GrooveDb::open_mem().unwrap();
        db.ensure_relations(&[&WIDGET]).unwrap();
        db
    }

    fn widget(id: &str, size: i64) -> Vec<DataValue> {
        vec![dv_str(id), dv_int(size), DataValue::Null]
    }

    #[test]
    fn create_script_lists_typed_columns() {
        assert_eq!(
            WIDGET.create_script(),
            ":create widget { id: String => size: Int, weight: Float? }"
        );
        assert_eq!(WIDGET.select(""), "?[id, size, weight] := *widget{id, size, weight}");
    }

    #[test]
    fn ensure_relations_is_idempotent() {
        let db = db();
        db.ensure_relations(&[&WIDGET]).unwrap();
    }

    #[test]
    fn batch_commit_writes_all_blocks() {
        let db = db();
        let mut batch = ScriptBatch::new();
        batch.put(&WIDGET, vec![widget("a", 1), widget("b", 2)]);
        batch.put(&WIDGET, vec![widget("c", 3)]);
        batch.put(&WIDGET, vec![]);
        assert_eq!(batch.len(), 2);
        db.commit(batch).unwrap();

        let rows = db.run_query(&WIDGET.select(""), BTreeMap::new()).unwrap();
        assert_eq!(rows.rows.len(), 3);
    }

    #[test]
    fn failed_insert_rolls_back_whole_batch() {
        let db = db();
        let mut first = ScriptBatch::new();
        first.insert(&WIDGET, vec![widget("a", 1)]);
        db.commit(first).unwrap();

        let mut second = ScriptBatch::new();
        second.put(&WIDGET, vec![widget("b", 2)]);
        second.insert(&WIDGET, vec![widget("a", 9)]);
        assert!(db.commit(second).is_err());

        let rows = db.run_query(&WIDGET.select(""), BTreeMap::new()).unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(get_int(&rows.rows[0], 1, "size").unwrap(), 1);
    }

    #[test]
    fn extend_renumbers_parameters() {
        let db = db();
        let mut a = ScriptBatch::new();
        a.put(&WIDGET, vec![widget("a", 1)]);
        let mut b = ScriptBatch::new();
        b.put(&WIDGET, vec![widget("b", 2)]);
        a.extend(b);
        db.commit(a).unwrap();

        let rows = db
            .run_query(
                &WIDGET.select("id = $id"),
                params1("id", dv_str("b")),
            )
            .unwrap();
        assert_eq!(get_int(&rows.rows[0], 1, "size").unwrap(), 2);
    }

    #[test]
    fn remove_deletes_by_key() {
        let db = db();
        let mut batch = ScriptBatch::new();
        batch.put(&WIDGET, vec![widget("a", 1)]);
        db.commit(batch).unwrap();

        let mut batch = ScriptBatch::new();
        batch.remove(&WIDGET, vec![vec![dv_str("a")]]);
        db.commit(batch).unwrap();

        let rows = db.run_query(&WIDGET.select(""), BTreeMap::new()).unwrap();
        assert!(rows.rows.is_empty());
    }

    #[test]
    fn optional_columns_read_back_as_none() {
        let row = widget("a", 1);
        assert_eq!(get_opt_float(&row, 2, "weight").unwrap(), None);
        assert!(get_str(&row, 5, "missing").is_err());
    }

    #[test]
    fn rocksdb_without_feature_is_config_error() {
        let config = StoreConfig {
            engine: StoreEngine::Rocksdb,
            path: None,
        };
        if cfg!(not(feature = "rocksdb")) {
            assert!(matches!(GrooveDb::open(&config), Err(GrooveError::Config(_))));
        }
    }
}
