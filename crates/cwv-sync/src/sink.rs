//! Sink writer: data rows and audit records into their tabs.

use anyhow::Context;
use cwv_core::{Cell, ExecutionRecord, NormalizedRow, AUDIT_HEADER, AUDIT_TAB, DATA_HEADER};
use cwv_normalize::ZonedClock;
use cwv_storage::TableStore;
use tracing::{info, warn};

fn header_cells(header: &[&str]) -> Vec<Cell> {
    header.iter().map(|h| Cell::from(*h)).collect()
}

/// Resolve `tab`, creating it with `header` as row 1 when absent.
///
/// An existing tab whose header width differs from `header` is logged and
/// left alone.
pub async fn ensure_tab(
    store: &dyn TableStore,
    table_id: &str,
    tab: &str,
    header: &[&str],
) -> anyhow::Result<()> {
    if !store
        .has_tab(table_id, tab)
        .await
        .with_context(|| format!("resolving tab {tab}"))?
    {
        store
            .create_tab(table_id, tab)
            .await
            .with_context(|| format!("creating tab {tab}"))?;
        store
            .write_rows(table_id, tab, 1, vec![header_cells(header)])
            .await
            .with_context(|| format!("writing header to {tab}"))?;
        info!(tab, columns = header.len(), "created tab");
        return Ok(());
    }

    let rows = store
        .read_rows(table_id, tab)
        .await
        .with_context(|| format!("reading {tab}"))?;
    if let Some(existing) = rows.first() {
        if existing.len() != header.len() {
            warn!(
                tab,
                expected = header.len(),
                found = existing.len(),
                "header column count mismatch"
            );
        }
    }
    Ok(())
}

async fn append(
    store: &dyn TableStore,
    table_id: &str,
    tab: &str,
    rows: Vec<Vec<Cell>>,
) -> anyhow::Result<usize> {
    let count = rows.len();
    let last_row = store
        .last_row(table_id, tab)
        .await
        .with_context(|| format!("locating last row of {tab}"))?;
    store
        .write_rows(table_id, tab, last_row + 1, rows)
        .await
        .with_context(|| format!("appending {count} rows to {tab}"))?;
    Ok(count)
}

/// Append data rows below the last populated row of `tab`.
pub async fn write_rows(
    store: &dyn TableStore,
    table_id: &str,
    tab: &str,
    rows: &[NormalizedRow],
) -> anyhow::Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    ensure_tab(store, table_id, tab, &DATA_HEADER).await?;
    let cells = rows.iter().map(|r| r.cells().to_vec()).collect();
    let written = append(store, table_id, tab, cells).await?;
    info!(tab, rows = written, "appended data rows");
    Ok(written)
}

/// Append one audit row per record, all sharing one flush timestamp.
pub async fn flush_audit(
    store: &dyn TableStore,
    table_id: &str,
    records: &[ExecutionRecord],
    clock: &ZonedClock,
) -> anyhow::Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    ensure_tab(store, table_id, AUDIT_TAB, &AUDIT_HEADER).await?;
    let flushed_at = clock.timestamp();
    let cells = records.iter().map(|r| r.audit_cells(&flushed_at)).collect();
    let written = append(store, table_id, AUDIT_TAB, cells).await?;
    info!(tab = AUDIT_TAB, rows = written, "flushed audit records");
    Ok(written)
}
