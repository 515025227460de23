//! Record store: scoped key-value rows in the `records` table.
//!
//! Writes are single-statement atomic upserts keyed by `(owner_id, namespace, key)`. An
//! overwrite keeps the row's `id` and `created_at` and only applies when the incoming
//! `updated_at` is not older than the stored one, so racing writers converge on the latest.

use std::collections::HashMap;

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use crate::db::Db;
use crate::memory::types::{now_timestamp, record_id, MemoryRecord, Scope};

const RECORD_COLUMNS: &str = "id, owner_id, namespace, key, value, tags, importance, scope, \
     access_count, feedback_score, last_accessed, created_at, updated_at";

/// Importance change applied per feedback vote.
pub const FEEDBACK_NUDGE: f64 = 0.05;

/// Filters for [`RecordStore::list`]. `None` fields do not filter.
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub tag: Option<String>,
    pub key_prefix: Option<String>,
    pub min_importance: Option<f64>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            namespace: None,
            tag: None,
            key_prefix: None,
            min_importance: None,
            limit: 100,
            offset: 0,
        }
    }
}

#[derive(Clone)]
pub struct RecordStore {
    db: Db,
}

impl RecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Write a persistent record stamped with the current time. Returns its id.
    pub fn put(
        &self,
        owner: &str,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
        tags: Vec<String>,
        importance: f64,
    ) -> Result<String> {
        let now = now_timestamp();
        let record = MemoryRecord {
            id: record_id(owner, namespace, key),
            owner_id: owner.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            tags,
            importance,
            scope: Scope::Persistent,
            access_count: 0,
            feedback_score: 0.0,
            last_accessed: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.upsert(&record)?;
        Ok(record.id)
    }

    /// Insert `record`, or overwrite the existing row for its identity triple.
    ///
    /// Returns `false` when an existing row is newer and the write was discarded. On
    /// overwrite, `id`, `created_at` and the access/feedback counters of the stored row
    /// are kept.
    pub fn upsert(&self, record: &MemoryRecord) -> Result<bool> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "INSERT INTO records (id, owner_id, namespace, key, value, tags, importance, scope, \
                 access_count, feedback_score, last_accessed, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(owner_id, namespace, key) DO UPDATE SET \
                 value = excluded.value, \
                 tags = excluded.tags, \
                 importance = excluded.importance, \
                 scope = excluded.scope, \
                 updated_at = excluded.updated_at \
             WHERE excluded.updated_at >= records.updated_at",
            params![
                record.id,
                record.owner_id,
                record.namespace,
                record.key,
                serde_json::to_string(&record.value)?,
                serde_json::to_string(&record.tags)?,
                record.importance,
                record.scope.as_str(),
                record.access_count as i64,
                record.feedback_score,
                record.last_accessed,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get(&self, owner: &str, namespace: &str, key: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.db.read()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records \
                     WHERE owner_id = ?1 AND namespace = ?2 AND key = ?3"
                ),
                params![owner, namespace, key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.db.read()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Batch-fetch records by id, restricted to `owner`. Missing ids are simply absent.
    pub fn get_many(&self, owner: &str, ids: &[String]) -> Result<HashMap<String, MemoryRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders: Vec<String> = (2..=ids.len() + 1).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE owner_id = ?1 AND id IN ({})",
            placeholders.join(", ")
        );
        let args = std::iter::once(owner.to_string()).chain(ids.iter().cloned());

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    /// Remove a record. Returns `false` if nothing was there.
    pub fn delete(&self, owner: &str, namespace: &str, key: &str) -> Result<bool> {
        self.delete_by_id(&record_id(owner, namespace, key))
    }

    pub fn delete_by_id(&self, id: &str) -> Result<bool> {
        let conn = self.db.lock()?;
        let n = conn.execute("DELETE FROM records WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    /// List an owner's records, newest first, then by key.
    pub fn list(&self, owner: &str, filter: &ListFilter) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE owner_id = ?");
        let mut args = vec![SqlValue::Text(owner.to_string())];

        if let Some(ns) = &filter.namespace {
            sql.push_str(" AND namespace = ?");
            args.push(SqlValue::Text(ns.clone()));
        }
        if let Some(tag) = &filter.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(records.tags) WHERE json_each.value = ?)");
            args.push(SqlValue::Text(tag.clone()));
        }
        if let Some(prefix) = &filter.key_prefix {
            sql.push_str(" AND substr(key, 1, length(?)) = ?");
            args.push(SqlValue::Text(prefix.clone()));
            args.push(SqlValue::Text(prefix.clone()));
        }
        if let Some(min) = filter.min_importance {
            sql.push_str(" AND importance >= ?");
            args.push(SqlValue::Real(min));
        }
        sql.push_str(" ORDER BY updated_at DESC, key ASC LIMIT ? OFFSET ?");
        args.push(SqlValue::Integer(filter.limit as i64));
        args.push(SqlValue::Integer(filter.offset as i64));

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Bump `access_count` and `last_accessed` for records returned by a recall.
    pub fn touch(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_timestamp();
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE records SET access_count = access_count + 1, last_accessed = ?1 \
                 WHERE id = ?2",
            )?;
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a usefulness vote: `feedback_score` moves by one and importance by
    /// [`FEEDBACK_NUDGE`], clamped to `[0, 1]`. Returns the updated record, if any.
    pub fn apply_feedback(
        &self,
        owner: &str,
        namespace: &str,
        key: &str,
        useful: bool,
    ) -> Result<Option<MemoryRecord>> {
        let (score_delta, nudge) = if useful {
            (1.0, FEEDBACK_NUDGE)
        } else {
            (-1.0, -FEEDBACK_NUDGE)
        };
        {
            let conn = self.db.lock()?;
            conn.execute(
                "UPDATE records SET feedback_score = feedback_score + ?1, \
                     importance = MIN(1.0, MAX(0.0, importance + ?2)) \
                 WHERE owner_id = ?3 AND namespace = ?4 AND key = ?5",
                params![score_delta, nudge, owner, namespace, key],
            )?;
        }
        self.get(owner, namespace, key)
    }

    /// Records for reindexing or export, ordered by owner, namespace, key.
    pub fn all_records(
        &self,
        owner: Option<&str>,
        include_ephemeral: bool,
    ) -> Result<Vec<MemoryRecord>> {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE 1 = 1");
        let mut args = Vec::new();
        if let Some(owner) = owner {
            sql.push_str(" AND owner_id = ?");
            args.push(SqlValue::Text(owner.to_string()));
        }
        if !include_ephemeral {
            sql.push_str(" AND scope = 'persistent'");
        }
        sql.push_str(" ORDER BY owner_id, namespace, key");

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `(id, updated_at)` for every record, used to queue a full reindex.
    pub fn all_versions(&self) -> Result<Vec<(String, String)>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare("SELECT id, updated_at FROM records ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Records at or below `max_importance`, least important first.
    pub fn low_importance(
        &self,
        owner: &str,
        namespace: Option<&str>,
        max_importance: f64,
    ) -> Result<Vec<MemoryRecord>> {
        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE owner_id = ?1 AND (?2 IS NULL OR namespace = ?2) AND importance <= ?3 \
             ORDER BY importance ASC, updated_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![owner, namespace, max_importance], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.db.read()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let value: String = row.get(4)?;
    let tags: String = row.get(5)?;
    let scope: String = row.get(7)?;
    let access_count: i64 = row.get(8)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        namespace: row.get(2)?,
        key: row.get(3)?,
        value: serde_json::from_str(&value).map_err(|e| conversion_error(4, e))?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(5, e))?,
        importance: row.get(6)?,
        scope: scope
            .parse()
            .map_err(|e: String| conversion_error(7, std::io::Error::other(e)))?,
        access_count: access_count.max(0) as u64,
        feedback_score: row.get(9)?,
        last_accessed: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> RecordStore {
        RecordStore::new(Db::open_in_memory().unwrap())
    }

    fn record_at(owner: &str, key: &str, value: &str, updated_at: &str) -> MemoryRecord {
        MemoryRecord {
            id: record_id(owner, "shared", key),
            owner_id: owner.into(),
            namespace: "shared".into(),
            key: key.into(),
            value: json!(value),
            tags: vec![],
            importance: 0.5,
            scope: Scope::Persistent,
            access_count: 0,
            feedback_score: 0.0,
            last_accessed: None,
            created_at: updated_at.into(),
            updated_at: updated_at.into(),
        }
    }

    #[test]
    fn put_then_get() {
        let store = store();
        let id = store
            .put("u1", "shared", "lang_pref", json!("prefers Go"), vec!["lang".into()], 0.7)
            .unwrap();
        let record = store.get("u1", "shared", "lang_pref").unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.value, json!("prefers Go"));
        assert_eq!(record.tags, vec!["lang".to_string()]);
        assert_eq!(store.get_by_id(&id).unwrap().unwrap().key, "lang_pref");
    }

    #[test]
    fn missing_record_is_none() {
        let store = store();
        assert!(store.get("u1", "shared", "nope").unwrap().is_none());
        assert!(store.get_by_id("0000").unwrap().is_none());
    }

    #[test]
    fn overwrite_keeps_id_and_created_at() {
        let store = store();
        let first = record_at("u1", "k", "v1", "2026-01-01T00:00:00.000000Z");
        let mut second = record_at("u1", "k", "v2", "2026-01-02T00:00:00.000000Z");
        second.created_at = "2026-01-02T00:00:00.000000Z".into();
        assert!(store.upsert(&first).unwrap());
        assert!(store.upsert(&second).unwrap());

        let stored = store.get("u1", "shared", "k").unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.value, json!("v2"));
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(stored.updated_at, second.updated_at);
    }

    #[test]
    fn older_write_is_discarded() {
        let store = store();
        let newer = record_at("u1", "k", "newer", "2026-01-02T00:00:00.000000Z");
        let older = record_at("u1", "k", "older", "2026-01-01T00:00:00.000000Z");
        store.upsert(&newer).unwrap();
        assert!(!store.upsert(&older).unwrap());
        assert_eq!(
            store.get("u1", "shared", "k").unwrap().unwrap().value,
            json!("newer")
        );
    }

    #[test]
    fn delete_is_idempotent() {
        let store = store();
        store.put("u1", "shared", "k", json!(1), vec![], 0.5).unwrap();
        assert!(store.delete("u1", "shared", "k").unwrap());
        assert!(!store.delete("u1", "shared", "k").unwrap());
    }

    #[test]
    fn list_filters_and_orders() {
        let store = store();
        let mut a = record_at("u1", "pref_a", "a", "2026-01-01T00:00:00.000000Z");
        a.tags = vec!["x".into()];
        let mut b = record_at("u1", "pref_b", "b", "2026-01-03T00:00:00.000000Z");
        b.importance = 0.9;
        let c = record_at("u1", "other", "c", "2026-01-02T00:00:00.000000Z");
        let foreign = record_at("u2", "pref_a", "z", "2026-01-04T00:00:00.000000Z");
        for r in [&a, &b, &c, &foreign] {
            store.upsert(r).unwrap();
        }

        let all = store.list("u1", &ListFilter::default()).unwrap();
        let keys: Vec<&str> = all.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["pref_b", "other", "pref_a"]);

        let prefixed = store
            .list(
                "u1",
                &ListFilter {
                    key_prefix: Some("pref_".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(prefixed.len(), 2);

        let tagged = store
            .list(
                "u1",
                &ListFilter {
                    tag: Some("x".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].key, "pref_a");

        let important = store
            .list(
                "u1",
                &ListFilter {
                    min_importance: Some(0.8),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(important.len(), 1);

        let page = store
            .list(
                "u1",
                &ListFilter {
                    limit: 1,
                    offset: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page[0].key, "other");
    }

    #[test]
    fn touch_tracks_access() {
        let store = store();
        let id = store.put("u1", "shared", "k", json!(1), vec![], 0.5).unwrap();
        store.touch(&[id.clone()]).unwrap();
        store.touch(&[id.clone()]).unwrap();
        let record = store.get_by_id(&id).unwrap().unwrap();
        assert_eq!(record.access_count, 2);
        assert!(record.last_accessed.is_some());
    }

    #[test]
    fn feedback_nudges_and_clamps() {
        let store = store();
        store.put("u1", "shared", "k", json!(1), vec![], 0.98).unwrap();
        let up = store.apply_feedback("u1", "shared", "k", true).unwrap().unwrap();
        assert_eq!(up.importance, 1.0);
        assert_eq!(up.feedback_score, 1.0);

        let down = store.apply_feedback("u1", "shared", "k", false).unwrap().unwrap();
        assert!((down.importance - 0.95).abs() < 1e-9);
        assert_eq!(down.feedback_score, 0.0);

        assert!(store.apply_feedback("u1", "shared", "missing", true).unwrap().is_none());
    }

    #[test]
    fn all_records_skips_ephemeral_by_default() {
        let store = store();
        store.upsert(&record_at("u1", "keep", "v", "2026-01-01T00:00:00.000000Z")).unwrap();
        let mut eph = record_at("u1", "tmp", "v", "2026-01-01T00:00:00.000000Z");
        eph.scope = Scope::Ephemeral;
        store.upsert(&eph).unwrap();

        assert_eq!(store.all_records(Some("u1"), false).unwrap().len(), 1);
        assert_eq!(store.all_records(Some("u1"), true).unwrap().len(), 2);
        assert_eq!(store.all_versions().unwrap().len(), 2);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn low_importance_is_scoped() {
        let store = store();
        store.put("u1", "shared", "low", json!(1), vec![], 0.1).unwrap();
        store.put("u1", "work", "low2", json!(1), vec![], 0.2).unwrap();
        store.put("u1", "shared", "high", json!(1), vec![], 0.9).unwrap();
        store.put("u2", "shared", "low", json!(1), vec![], 0.1).unwrap();

        let all = store.low_importance("u1", None, 0.3).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "low");
        let shared = store.low_importance("u1", Some("shared"), 0.3).unwrap();
        assert_eq!(shared.len(), 1);
    }
}
