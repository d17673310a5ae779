use oanda_core::{DataError, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::debug;

use crate::delimiter_for;

/// The persisted transaction row: id, time, and the raw payload as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionCsvRow {
    pub id: i64,
    pub time: String,
    pub json: String,
}

impl From<&Transaction> for TransactionCsvRow {
    fn from(txn: &Transaction) -> Self {
        Self {
            id: txn.id,
            time: txn.time.clone(),
            json: txn.json(),
        }
    }
}

/// Read back the ids already present in a transaction CSV file. This is the
/// implicit sync cursor: recomputed from the sink on every run.
pub fn read_existing_transaction_ids(path: &Path) -> Result<HashSet<i64>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .from_path(path)
        .map_err(|e| DataError::ParseError(format!("failed to open {}: {e}", path.display())))?;
    let mut ids = HashSet::new();
    for row in reader.deserialize::<TransactionCsvRow>() {
        let row = row
            .map_err(|e| DataError::ParseError(format!("bad row in {}: {e}", path.display())))?;
        ids.insert(row.id);
    }
    Ok(ids)
}

/// Append strictly-new transactions to a CSV file: header only when the
/// file is created, existing ids never re-inserted. Returns the number of
/// appended rows.
pub fn append_transactions_csv(
    path: &Path,
    transactions: &[Transaction],
) -> Result<u64, DataError> {
    let delimiter = delimiter_for(path);
    if path.is_file() {
        let existing = read_existing_transaction_ids(path)?;
        let new: Vec<&Transaction> = transactions
            .iter()
            .filter(|t| !existing.contains(&t.id))
            .collect();
        debug!(path = %path.display(), new = new.len(), "appending transactions");
        if new.is_empty() {
            return Ok(0);
        }
        let file = OpenOptions::new().append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(delimiter)
            .from_writer(file);
        for txn in &new {
            writer
                .serialize(TransactionCsvRow::from(*txn))
                .map_err(|e| DataError::ParseError(e.to_string()))?;
        }
        writer.flush()?;
        Ok(new.len() as u64)
    } else {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)
            .map_err(|e| DataError::ParseError(format!("failed to create {}: {e}", path.display())))?;
        for txn in transactions {
            writer
                .serialize(TransactionCsvRow::from(txn))
                .map_err(|e| DataError::ParseError(e.to_string()))?;
        }
        writer.flush()?;
        Ok(transactions.len() as u64)
    }
}

/// Read the raw JSON column of a transaction CSV/TSV file (for plotting).
pub fn read_transaction_json_csv(path: &Path) -> Result<Vec<String>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .from_path(path)
        .map_err(|e| DataError::ParseError(format!("failed to open {}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<TransactionCsvRow>() {
        let row = row
            .map_err(|e| DataError::ParseError(format!("bad row in {}: {e}", path.display())))?;
        rows.push(row.json);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn txn(id: i64) -> Transaction {
        Transaction::from_value(json!({
            "id": id.to_string(),
            "time": format!("2024-05-01T00:00:{id:02}Z"),
            "type": "ORDER_FILL"
        }))
        .unwrap()
    }

    #[test]
    fn test_idempotent_append() {
        let path = std::env::temp_dir().join("test_txn_append.csv");
        let _ = fs::remove_file(&path);

        let written = append_transactions_csv(&path, &[txn(1), txn(2), txn(3)]).unwrap();
        assert_eq!(written, 3);

        // Overlapping batch: only the strictly-new ids land.
        let written = append_transactions_csv(&path, &[txn(2), txn(3), txn(4), txn(5)]).unwrap();
        assert_eq!(written, 2);

        let ids = read_existing_transaction_ids(&path).unwrap();
        assert_eq!(ids, HashSet::from([1, 2, 3, 4, 5]));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_rerun_with_same_batch_appends_nothing() {
        let path = std::env::temp_dir().join("test_txn_rerun.csv");
        let _ = fs::remove_file(&path);

        append_transactions_csv(&path, &[txn(10), txn(11)]).unwrap();
        let written = append_transactions_csv(&path, &[txn(10), txn(11)]).unwrap();
        assert_eq!(written, 0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_tsv_delimiter_roundtrip() {
        let path = std::env::temp_dir().join("test_txn_roundtrip.tsv");
        let _ = fs::remove_file(&path);

        append_transactions_csv(&path, &[txn(7)]).unwrap();
        let jsons = read_transaction_json_csv(&path).unwrap();
        assert_eq!(jsons.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&jsons[0]).unwrap();
        assert_eq!(value["id"], json!(7));

        let _ = fs::remove_file(&path);
    }
}
