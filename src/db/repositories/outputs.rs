use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;

use crate::db::{
    helpers::{distinct_ids, placeholders, SQL_CHUNK},
    models::{normalize_outputs, OutputRecord},
    Database,
};

/// Outputs for `entry_ids` in insertion order, keyed by entry id. Every
/// requested id has a (possibly empty) bucket.
pub(crate) fn fetch_outputs(
    conn: &Connection,
    entry_ids: &[String],
) -> Result<HashMap<String, Vec<OutputRecord>>> {
    let mut outputs: HashMap<String, Vec<OutputRecord>> = entry_ids
        .iter()
        .map(|id| (id.clone(), Vec::new()))
        .collect();

    for chunk in entry_ids.chunks(SQL_CHUNK) {
        let sql = format!(
            "SELECT entry_id, filename, subfolder, type FROM prompt_history_output
             WHERE entry_id IN ({})
             ORDER BY id",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
        while let Some(row) = rows.next()? {
            let entry_id: String = row.get("entry_id")?;
            let record = OutputRecord::new(
                row.get::<_, String>("filename")?,
                row.get::<_, String>("subfolder")?,
                row.get::<_, String>("type")?,
            );
            outputs.entry(entry_id).or_default().push(record);
        }
    }

    Ok(outputs)
}

impl Database {
    /// Normalize loose host payloads and attach them to every listed entry.
    /// Unparseable payloads are dropped. Returns how many rows were inserted.
    pub fn add_outputs_for_entries<S: AsRef<str>>(
        &self,
        entry_ids: &[S],
        outputs: &[Value],
    ) -> Result<usize> {
        self.add_output_records(entry_ids, normalize_outputs(outputs))
    }

    /// Attach already-parsed records. Existing `(entry, filename, subfolder,
    /// type)` tuples and unknown entry ids are skipped.
    pub fn add_output_records<S: AsRef<str>>(
        &self,
        entry_ids: &[S],
        records: Vec<OutputRecord>,
    ) -> Result<usize> {
        let targets = distinct_ids(entry_ids);
        if targets.is_empty() || records.is_empty() {
            return Ok(0);
        }

        self.transaction(move |tx| {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO prompt_history_output (entry_id, filename, subfolder, type)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM prompt_history WHERE id = ?1)",
            )?;
            let mut inserted = 0;
            for entry_id in &targets {
                for record in &records {
                    inserted += stmt
                        .execute(params![
                            entry_id,
                            record.filename,
                            record.subfolder,
                            record.kind
                        ])
                        .context("failed to insert output record")?;
                }
            }
            Ok(inserted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Metadata;
    use serde_json::json;

    fn open_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("prompt_history.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn duplicate_outputs_are_stored_once() {
        let (_dir, db) = open_db();
        let entry = db.append("p", Metadata::new()).unwrap();
        let payload = [json!({"filename": "x.png", "subfolder": "", "type": "output"})];

        assert_eq!(db.add_outputs_for_entries(&[entry.id.as_str()], &payload).unwrap(), 1);
        assert_eq!(db.add_outputs_for_entries(&[entry.id.as_str()], &payload).unwrap(), 0);

        let stored = db.get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.files, vec![OutputRecord::new("x.png", "", "output")]);
    }

    #[test]
    fn same_file_with_another_type_is_distinct() {
        let (_dir, db) = open_db();
        let entry = db.append("p", Metadata::new()).unwrap();

        db.add_outputs_for_entries(
            &[entry.id.as_str()],
            &[
                json!({"filename": "x.png", "type": "output"}),
                json!({"filename": "x.png", "type": "temp"}),
            ],
        )
        .unwrap();

        let stored = db.get_entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.files.len(), 2);
    }

    #[test]
    fn junk_payloads_and_unknown_entries_are_skipped() {
        let (_dir, db) = open_db();
        let entry = db.append("p", Metadata::new()).unwrap();

        let inserted = db
            .add_outputs_for_entries(
                &[entry.id.as_str(), "missing"],
                &[json!(42), json!({"filename": ""}), json!("ok.png")],
            )
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn list_attaches_outputs_in_insertion_order() {
        let (_dir, db) = open_db();
        let a = db.append("a", Metadata::new()).unwrap();
        let b = db.append("b", Metadata::new()).unwrap();

        db.add_outputs_for_entries(&[a.id.as_str()], &[json!("a1.png"), json!("a2.png")])
            .unwrap();
        db.add_outputs_for_entries(&[b.id.as_str()], &[json!("b1.png")])
            .unwrap();

        let entries = db.list(None).unwrap();
        let files_of = |id: &str| {
            entries
                .iter()
                .find(|entry| entry.id == id)
                .map(|entry| {
                    entry
                        .files
                        .iter()
                        .map(|file| file.filename.clone())
                        .collect::<Vec<_>>()
                })
                .unwrap()
        };
        assert_eq!(files_of(&a.id), vec!["a1.png", "a2.png"]);
        assert_eq!(files_of(&b.id), vec!["b1.png"]);
    }

    #[test]
    fn deleting_an_entry_removes_its_outputs() {
        let (_dir, db) = open_db();
        let entry = db.append("p", Metadata::new()).unwrap();
        db.add_outputs_for_entries(&[entry.id.as_str()], &[json!("x.png")])
            .unwrap();

        db.delete(&entry.id).unwrap();
        let remaining: i64 = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM prompt_history_output", [], |row| {
                    row.get(0)
                })?)
            })
            .unwrap();
        assert_eq!(remaining, 0);
    }
}
