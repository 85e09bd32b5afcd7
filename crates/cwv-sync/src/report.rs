use anyhow::Result;
use cwv_core::{Cell, AUDIT_HEADER, AUDIT_TAB};
use cwv_storage::TableStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ExecutionTally {
    execution_id: String,
    timestamp: String,
    requests: usize,
    succeeded: usize,
    failed: usize,
    normalized: usize,
}

fn cell_text(row: &[Cell], idx: usize) -> String {
    row.get(idx).map(|c| c.to_string()).unwrap_or_default()
}

/// Markdown overview of the last `runs` executions in the audit tab.
pub async fn history_markdown(store: &dyn TableStore, table_id: &str, runs: usize) -> Result<String> {
    let mut lines = vec!["# CWV Execution History".to_string(), String::new()];
    if !store.has_tab(table_id, AUDIT_TAB).await? {
        lines.push("No executions recorded.".to_string());
        return Ok(lines.join("\n"));
    }

    let rows = store.read_rows(table_id, AUDIT_TAB).await?;
    let mut tallies: Vec<ExecutionTally> = Vec::new();
    for row in rows.iter().filter(|r| !r.is_empty()) {
        let execution_id = cell_text(row, 0);
        if execution_id == AUDIT_HEADER[0] {
            continue;
        }
        let idx = match tallies.iter().position(|t| t.execution_id == execution_id) {
            Some(idx) => idx,
            None => {
                tallies.push(ExecutionTally {
                    execution_id: execution_id.clone(),
                    timestamp: cell_text(row, 1),
                    ..Default::default()
                });
                tallies.len() - 1
            }
        };
        let tally = &mut tallies[idx];
        tally.requests += 1;
        match cell_text(row, 4).as_str() {
            "SUCCESS" => tally.succeeded += 1,
            "FAILED" => tally.failed += 1,
            _ => {}
        }
        if cell_text(row, 7) == "YES" {
            tally.normalized += 1;
        }
    }

    let skip = tallies.len().saturating_sub(runs.max(1));
    for tally in tallies.into_iter().skip(skip).rev() {
        lines.push(format!("## Execution `{}`", tally.execution_id));
        lines.push(format!("- flushed: {}", tally.timestamp));
        lines.push(format!("- requests: {}", tally.requests));
        lines.push(format!("- succeeded: {}", tally.succeeded));
        lines.push(format!("- failed: {}", tally.failed));
        lines.push(format!("- normalized: {}", tally.normalized));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
