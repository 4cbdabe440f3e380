use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::db::{
    helpers::{
        canonical_metadata, deserialize_metadata, distinct_ids, format_timestamp,
        parse_datetime, placeholders, serialize_metadata, SQL_CHUNK,
    },
    models::{HistoryEntry, Metadata},
    Database,
};

use super::outputs::fetch_outputs;

const ENTRY_COLUMNS: &str = "id, created_at, last_used_at, prompt, metadata";

fn row_to_entry(row: &Row) -> Result<HistoryEntry> {
    let created_at: String = row.get("created_at")?;
    let last_used_at: Option<String> = row.get("last_used_at")?;
    let metadata: String = row.get("metadata")?;
    let created_at = parse_datetime(&created_at, "created_at")?;

    Ok(HistoryEntry {
        id: row.get("id")?,
        created_at,
        last_used_at: match last_used_at {
            Some(raw) => parse_datetime(&raw, "last_used_at")?,
            None => created_at,
        },
        prompt: row.get("prompt")?,
        metadata: deserialize_metadata(&metadata),
        files: Vec::new(),
    })
}

/// How `merge_metadata` treats keys that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeMode {
    Overwrite,
    FillMissing,
}

fn find_matching_entry(
    conn: &Connection,
    prompt: &str,
    serialized: &str,
    metadata: &Metadata,
    fallback_limit: usize,
) -> Result<Option<HistoryEntry>> {
    let exact = conn
        .query_row(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM prompt_history
                 WHERE prompt = ?1 AND metadata = ?2
                 ORDER BY last_used_at DESC
                 LIMIT 1"
            ),
            params![prompt, serialized],
            |row| Ok(row_to_entry(row)),
        )
        .optional()
        .context("failed to look up entry by prompt and metadata")?
        .transpose()?;
    if exact.is_some() {
        return Ok(exact);
    }

    // Equal maps may have been stored with different key order or spacing.
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM prompt_history
         WHERE prompt = ?1
         ORDER BY last_used_at DESC, created_at DESC
         LIMIT ?2"
    ))?;
    let mut rows = stmt.query(params![prompt, fallback_limit as i64])?;
    while let Some(row) = rows.next()? {
        let candidate = row_to_entry(row)?;
        if &candidate.metadata == metadata {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn insert_entry(
    tx: &Transaction<'_>,
    prompt: String,
    metadata: Metadata,
    serialized: &str,
    now: DateTime<Utc>,
) -> Result<HistoryEntry> {
    let entry = HistoryEntry {
        id: Uuid::new_v4().to_string(),
        created_at: now,
        last_used_at: now,
        prompt,
        metadata,
        files: Vec::new(),
    };
    tx.execute(
        "INSERT INTO prompt_history (id, created_at, last_used_at, prompt, tags, metadata)
         VALUES (?1, ?2, ?3, ?4, '[]', ?5)",
        params![
            entry.id,
            format_timestamp(entry.created_at),
            format_timestamp(entry.last_used_at),
            entry.prompt,
            serialized,
        ],
    )
    .context("failed to insert history entry")?;
    Ok(entry)
}

fn merge_metadata(
    tx: &Transaction<'_>,
    entry_id: &str,
    updates: Metadata,
    mode: MergeMode,
) -> Result<bool> {
    let stored: Option<String> = tx
        .query_row(
            "SELECT metadata FROM prompt_history WHERE id = ?1",
            params![entry_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read entry metadata")?;
    let Some(stored) = stored else {
        return Ok(false);
    };

    let mut current = deserialize_metadata(&stored);
    let mut changed = false;
    for (key, value) in updates {
        let differs = match (current.get(&key), mode) {
            (None, _) => true,
            (Some(existing), MergeMode::Overwrite) => existing != &value,
            (Some(_), MergeMode::FillMissing) => false,
        };
        if differs {
            current.insert(key, value);
            changed = true;
        }
    }
    if !changed {
        return Ok(false);
    }

    tx.execute(
        "UPDATE prompt_history SET metadata = ?1 WHERE id = ?2",
        params![serialize_metadata(&current)?, entry_id],
    )
    .context("failed to update entry metadata")?;
    Ok(true)
}

impl Database {
    /// Return the entry matching `(prompt, metadata)`, creating it when none
    /// exists. The flag is `true` only for a newly created entry; matched
    /// entries are returned untouched.
    pub fn ensure_entry(&self, prompt: &str, metadata: Metadata) -> Result<(HistoryEntry, bool)> {
        let prompt = prompt.to_string();
        let metadata = canonical_metadata(metadata)?;
        let serialized = serialize_metadata(&metadata)?;
        let fallback_limit = self.limits().fallback_lookup;
        let now = self.stamp();

        self.transaction(move |tx| {
            if let Some(mut existing) =
                find_matching_entry(tx, &prompt, &serialized, &metadata, fallback_limit)?
            {
                existing.files = fetch_outputs(tx, std::slice::from_ref(&existing.id))?
                    .remove(&existing.id)
                    .unwrap_or_default();
                return Ok((existing, false));
            }
            let entry = insert_entry(tx, prompt, metadata, &serialized, now)?;
            Ok((entry, true))
        })
    }

    /// Insert a new entry without looking for a match.
    pub fn append(&self, prompt: &str, metadata: Metadata) -> Result<HistoryEntry> {
        let prompt = prompt.to_string();
        let metadata = canonical_metadata(metadata)?;
        let serialized = serialize_metadata(&metadata)?;
        let now = self.stamp();

        self.transaction(move |tx| insert_entry(tx, prompt, metadata, &serialized, now))
    }

    pub fn get_entry(&self, entry_id: &str) -> Result<Option<HistoryEntry>> {
        let entry_id = entry_id.to_string();
        self.execute(move |conn| {
            let entry = conn
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM prompt_history WHERE id = ?1"),
                    params![entry_id],
                    |row| Ok(row_to_entry(row)),
                )
                .optional()
                .context("failed to load history entry")?
                .transpose()?;
            let Some(mut entry) = entry else {
                return Ok(None);
            };
            entry.files = fetch_outputs(conn, std::slice::from_ref(&entry.id))?
                .remove(&entry.id)
                .unwrap_or_default();
            Ok(Some(entry))
        })
    }

    /// Most recently used entries first, outputs attached. `None` uses the
    /// default page size; every request is capped at the configured maximum.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let limit = self.limits().clamp_list(limit);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM prompt_history
                 ORDER BY last_used_at DESC, created_at DESC, id DESC
                 LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![limit as i64])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_entry(row)?);
            }

            let ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
            let mut outputs = fetch_outputs(conn, &ids)?;
            for entry in &mut entries {
                entry.files = outputs.remove(&entry.id).unwrap_or_default();
            }

            Ok(entries)
        })
    }

    /// Refresh `last_used_at` for every listed entry; unknown ids are skipped.
    /// Returns how many entries were updated.
    pub fn touch_entries<S: AsRef<str>>(&self, entry_ids: &[S]) -> Result<usize> {
        let targets = distinct_ids(entry_ids);
        if targets.is_empty() {
            return Ok(0);
        }
        let now = format_timestamp(self.stamp());

        self.transaction(move |tx| {
            let mut stmt = tx.prepare(
                "UPDATE prompt_history
                 SET last_used_at = ?1
                 WHERE id = ?2 AND (last_used_at IS NULL OR last_used_at < ?1)",
            )?;
            let mut touched = 0;
            for entry_id in &targets {
                touched += stmt
                    .execute(params![now, entry_id])
                    .context("failed to touch history entry")?;
            }
            Ok(touched)
        })
    }

    /// Reverse lookup from prompt text to entry id. When several entries share
    /// a prompt the most recently used one wins.
    pub fn find_entry_ids_for_prompts<S: AsRef<str>>(
        &self,
        prompts: &[S],
    ) -> Result<HashMap<String, String>> {
        let candidates = distinct_ids(prompts);
        if candidates.is_empty() {
            return Ok(HashMap::new());
        }

        self.execute(move |conn| {
            let mut mapping = HashMap::new();
            for chunk in candidates.chunks(SQL_CHUNK) {
                let sql = format!(
                    "SELECT prompt, id FROM prompt_history
                     WHERE prompt IN ({})
                     ORDER BY last_used_at DESC, created_at DESC",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
                while let Some(row) = rows.next()? {
                    let prompt: String = row.get(0)?;
                    let id: String = row.get(1)?;
                    mapping.entry(prompt).or_insert(id);
                }
            }
            Ok(mapping)
        })
    }

    /// Merge `updates` into the entry's metadata. Keys are added or
    /// overwritten, never removed. Returns `false` without writing when
    /// nothing would change or the entry does not exist.
    pub fn update_metadata(&self, entry_id: &str, updates: Metadata) -> Result<bool> {
        self.merge_metadata_with(entry_id, updates, MergeMode::Overwrite)
    }

    /// Like `update_metadata`, but only keys the entry does not have yet are added.
    pub fn fill_metadata(&self, entry_id: &str, defaults: Metadata) -> Result<bool> {
        self.merge_metadata_with(entry_id, defaults, MergeMode::FillMissing)
    }

    fn merge_metadata_with(
        &self,
        entry_id: &str,
        updates: Metadata,
        mode: MergeMode,
    ) -> Result<bool> {
        if updates.is_empty() {
            return Ok(false);
        }
        let entry_id = entry_id.to_string();
        let updates = canonical_metadata(updates)?;
        self.transaction(move |tx| merge_metadata(tx, &entry_id, updates, mode))
    }

    /// Delete one entry and its outputs. Returns `false` if it did not exist.
    pub fn delete(&self, entry_id: &str) -> Result<bool> {
        let entry_id = entry_id.to_string();
        self.transaction(move |tx| {
            tx.execute(
                "DELETE FROM prompt_history_output WHERE entry_id = ?1",
                params![entry_id],
            )?;
            let removed = tx
                .execute("DELETE FROM prompt_history WHERE id = ?1", params![entry_id])
                .context("failed to delete history entry")?;
            Ok(removed > 0)
        })
    }

    /// Delete every entry and output.
    pub fn clear(&self) -> Result<()> {
        self.transaction(|tx| {
            tx.execute("DELETE FROM prompt_history_output", [])?;
            tx.execute("DELETE FROM prompt_history", [])
                .context("failed to clear history")?;
            Ok(())
        })
    }
}
