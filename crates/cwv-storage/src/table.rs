//! Spreadsheet-like table backends.
//!
//! Rows are addressed 1-based, matching spreadsheet conventions: row 1 is the
//! header once a tab has been bootstrapped, and appends land at `last_row + 1`.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context};
use async_trait::async_trait;
use cwv_core::Cell;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn has_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<bool>;

    /// Create an empty tab. Fails if the tab already exists.
    async fn create_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<()>;

    async fn read_rows(&self, table_id: &str, tab: &str) -> anyhow::Result<Vec<Vec<Cell>>>;

    /// Index of the last populated row, 0 for an empty tab.
    async fn last_row(&self, table_id: &str, tab: &str) -> anyhow::Result<usize>;

    /// Write `rows` starting at 1-based `start_row`, replacing whatever is there.
    async fn write_rows(
        &self,
        table_id: &str,
        tab: &str,
        start_row: usize,
        rows: Vec<Vec<Cell>>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workbook {
    pub tabs: Vec<WorkbookTab>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookTab {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Vec<Cell>>,
}

impl Workbook {
    pub fn tab(&self, name: &str) -> Option<&WorkbookTab> {
        self.tabs.iter().find(|t| t.name == name)
    }

    fn tab_mut(&mut self, name: &str) -> anyhow::Result<&mut WorkbookTab> {
        match self.tabs.iter_mut().find(|t| t.name == name) {
            Some(tab) => Ok(tab),
            None => bail!("tab {name} not found"),
        }
    }

    pub fn create_tab(&mut self, name: &str) -> anyhow::Result<()> {
        if self.tab(name).is_some() {
            bail!("tab {name} already exists");
        }
        self.tabs.push(WorkbookTab {
            name: name.to_string(),
            rows: Vec::new(),
        });
        Ok(())
    }

    pub fn rows(&self, name: &str) -> anyhow::Result<Vec<Vec<Cell>>> {
        self.tab(name)
            .map(|t| t.rows.clone())
            .with_context(|| format!("tab {name} not found"))
    }

    pub fn last_row(&self, name: &str) -> anyhow::Result<usize> {
        let tab = self.tab(name).with_context(|| format!("tab {name} not found"))?;
        Ok(tab
            .rows
            .iter()
            .rposition(|row| row.iter().any(|c| !matches!(c, Cell::Text(s) if s.is_empty())))
            .map(|idx| idx + 1)
            .unwrap_or(0))
    }

    pub fn write_rows(&mut self, name: &str, start_row: usize, rows: Vec<Vec<Cell>>) -> anyhow::Result<()> {
        if start_row == 0 {
            bail!("rows are 1-based; got start row 0");
        }
        let tab = self.tab_mut(name)?;
        let offset = start_row - 1;
        if tab.rows.len() < offset {
            tab.rows.resize_with(offset, Vec::new);
        }
        for (i, row) in rows.into_iter().enumerate() {
            let idx = offset + i;
            if idx < tab.rows.len() {
                tab.rows[idx] = row;
            } else {
                tab.rows.push(row);
            }
        }
        Ok(())
    }
}

/// One JSON workbook per table id under `root`, replaced atomically on every write.
#[derive(Debug)]
pub struct WorkbookStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl WorkbookStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn workbook_path(&self, table_id: &str) -> anyhow::Result<PathBuf> {
        let valid = !table_id.is_empty()
            && table_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !table_id.starts_with('.');
        if !valid {
            bail!("invalid table id {table_id:?}");
        }
        Ok(self.root.join(format!("{table_id}.json")))
    }

    pub async fn load(&self, table_id: &str) -> anyhow::Result<Workbook> {
        let path = self.workbook_path(table_id)?;
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking workbook path {}", path.display()))?
        {
            return Ok(Workbook::default());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn save(&self, table_id: &str, workbook: &Workbook) -> anyhow::Result<()> {
        let path = self.workbook_path(table_id)?;
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating workbook directory {}", self.root.display()))?;

        let bytes = serde_json::to_vec_pretty(workbook).context("serializing workbook")?;
        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp workbook file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp workbook file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp workbook file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp workbook {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        debug!(path = %path.display(), bytes = bytes.len(), "saved workbook");
        Ok(())
    }

    async fn update<F>(&self, table_id: &str, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Workbook) -> anyhow::Result<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut workbook = self.load(table_id).await?;
        apply(&mut workbook)?;
        self.save(table_id, &workbook).await
    }
}

#[async_trait]
impl TableStore for WorkbookStore {
    async fn has_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<bool> {
        Ok(self.load(table_id).await?.tab(tab).is_some())
    }

    async fn create_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<()> {
        self.update(table_id, |wb| wb.create_tab(tab)).await
    }

    async fn read_rows(&self, table_id: &str, tab: &str) -> anyhow::Result<Vec<Vec<Cell>>> {
        self.load(table_id).await?.rows(tab)
    }

    async fn last_row(&self, table_id: &str, tab: &str) -> anyhow::Result<usize> {
        self.load(table_id).await?.last_row(tab)
    }

    async fn write_rows(
        &self,
        table_id: &str,
        tab: &str,
        start_row: usize,
        rows: Vec<Vec<Cell>>,
    ) -> anyhow::Result<()> {
        self.update(table_id, |wb| wb.write_rows(tab, start_row, rows))
            .await
    }
}

/// In-process table store. Contents live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    workbooks: Mutex<HashMap<String, Workbook>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn has_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<bool> {
        let books = self.workbooks.lock().await;
        Ok(books.get(table_id).and_then(|wb| wb.tab(tab)).is_some())
    }

    async fn create_tab(&self, table_id: &str, tab: &str) -> anyhow::Result<()> {
        let mut books = self.workbooks.lock().await;
        books.entry(table_id.to_string()).or_default().create_tab(tab)
    }

    async fn read_rows(&self, table_id: &str, tab: &str) -> anyhow::Result<Vec<Vec<Cell>>> {
        let books = self.workbooks.lock().await;
        books
            .get(table_id)
            .with_context(|| format!("table {table_id} not found"))?
            .rows(tab)
    }

    async fn last_row(&self, table_id: &str, tab: &str) -> anyhow::Result<usize> {
        let books = self.workbooks.lock().await;
        books
            .get(table_id)
            .with_context(|| format!("table {table_id} not found"))?
            .last_row(tab)
    }

    async fn write_rows(
        &self,
        table_id: &str,
        tab: &str,
        start_row: usize,
        rows: Vec<Vec<Cell>>,
    ) -> anyhow::Result<()> {
        let mut books = self.workbooks.lock().await;
        books
            .get_mut(table_id)
            .with_context(|| format!("table {table_id} not found"))?
            .write_rows(tab, start_row, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(values: &[&str]) -> Vec<Cell> {
        values.iter().map(|v| Cell::from(*v)).collect()
    }

    #[tokio::test]
    async fn workbook_store_persists_across_instances() {
        let dir = tempdir().expect("tempdir");
        let store = WorkbookStore::new(dir.path());
        store.create_tab("sheet-1", "cruxData").await.unwrap();
        store
            .write_rows("sheet-1", "cruxData", 1, vec![row(&["Date", "Platform"])])
            .await
            .unwrap();

        let reopened = WorkbookStore::new(dir.path());
        assert!(reopened.has_tab("sheet-1", "cruxData").await.unwrap());
        assert_eq!(reopened.last_row("sheet-1", "cruxData").await.unwrap(), 1);
        assert_eq!(
            reopened.read_rows("sheet-1", "cruxData").await.unwrap(),
            vec![row(&["Date", "Platform"])]
        );
        assert!(dir.path().join("sheet-1.json").exists());
    }

    #[tokio::test]
    async fn creating_existing_tab_fails() {
        let store = MemoryTableStore::new();
        store.create_tab("t", "a").await.unwrap();
        assert!(store.create_tab("t", "a").await.is_err());
    }

    #[tokio::test]
    async fn write_past_end_pads_with_empty_rows() {
        let store = MemoryTableStore::new();
        store.create_tab("t", "a").await.unwrap();
        store.write_rows("t", "a", 3, vec![row(&["x"])]).await.unwrap();
        let rows = store.read_rows("t", "a").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_empty());
        assert_eq!(store.last_row("t", "a").await.unwrap(), 3);
    }

    #[test]
    fn last_row_ignores_trailing_blank_rows() {
        let mut wb = Workbook::default();
        wb.create_tab("a").unwrap();
        wb.write_rows("a", 1, vec![row(&["x"]), row(&[""]), vec![]]).unwrap();
        assert_eq!(wb.last_row("a").unwrap(), 1);
    }

    #[test]
    fn table_ids_cannot_escape_root() {
        let store = WorkbookStore::new("/tmp/cwv");
        assert!(store.workbook_path("../etc").is_err());
        assert!(store.workbook_path("a/b").is_err());
        assert!(store.workbook_path("").is_err());
        assert!(store.workbook_path("1AbC-_x").is_ok());
    }

    #[tokio::test]
    async fn missing_table_reads_fail() {
        let store = MemoryTableStore::new();
        assert!(store.read_rows("nope", "a").await.is_err());
        assert!(!store.has_tab("nope", "a").await.unwrap());
    }
}
