//! Term-scoring index over record content, backed by SQLite FTS5 (BM25).

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};

use crate::db::Db;
use crate::memory::{push_namespace_filter, IndexEntry};

pub trait LexicalIndex: Send + Sync {
    /// Replace the indexed text of the record.
    fn upsert(&self, entry: &IndexEntry<'_>, text: &str) -> Result<()>;

    /// Drop the record's postings. Returns how many rows were removed.
    fn remove(&self, record_id: &str) -> Result<usize>;

    /// Owner-scoped matches as `(record_id, score)`, best first, with scores normalized by
    /// the best match into `(0, 1]`. Any query term matching is enough.
    fn search(
        &self,
        owner: &str,
        namespaces: Option<&[String]>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    fn clear(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct Fts5LexicalIndex {
    db: Db,
}

impl Fts5LexicalIndex {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl LexicalIndex for Fts5LexicalIndex {
    fn upsert(&self, entry: &IndexEntry<'_>, text: &str) -> Result<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM records_fts WHERE record_id = ?1",
            params![entry.record_id],
        )?;
        tx.execute(
            "INSERT INTO records_fts (content, record_id, owner_id, namespace) \
             VALUES (?1, ?2, ?3, ?4)",
            params![text, entry.record_id, entry.owner_id, entry.namespace],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, record_id: &str) -> Result<usize> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "DELETE FROM records_fts WHERE record_id = ?1",
            params![record_id],
        )?;
        Ok(n)
    }

    fn search(
        &self,
        owner: &str,
        namespaces: Option<&[String]>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT record_id, bm25(records_fts) AS rank FROM records_fts \
             WHERE records_fts MATCH ? AND owner_id = ?",
        );
        let mut args = vec![SqlValue::Text(escaped), SqlValue::Text(owner.to_string())];
        push_namespace_filter(&mut sql, &mut args, namespaces);
        sql.push_str(" ORDER BY rank ASC, record_id ASC LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(normalize_ranks(rows))
    }

    fn clear(&self) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM records_fts", [])?;
        Ok(())
    }
}

/// BM25 ranks are negative (more negative = better). Divide by the best rank so the top
/// match scores 1.0 and the rest fall in `(0, 1]`.
fn normalize_ranks(rows: Vec<(String, f64)>) -> Vec<(String, f64)> {
    let best = rows.first().map(|(_, rank)| *rank).unwrap_or(0.0);
    rows.into_iter()
        .map(|(id, rank)| {
            let score = if best < 0.0 { (rank / best).clamp(0.0, 1.0) } else { 1.0 };
            (id, score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect()
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Each whitespace-delimited word becomes a quoted string; words are OR-ed so a record
/// matching any of them is a candidate.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(id: &'a str, owner: &'a str, ns: &'a str) -> IndexEntry<'a> {
        IndexEntry {
            record_id: id,
            owner_id: owner,
            namespace: ns,
        }
    }

    #[test]
    fn stemmed_terms_match() {
        let index = Fts5LexicalIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), "lang pref prefers Go").unwrap();
        index.upsert(&entry("b", "u1", "shared"), "quantum computing").unwrap();

        let hits = index.search("u1", None, "preferred language", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[0].1, 1.0);
    }

    #[test]
    fn scores_are_normalized_by_best() {
        let index = Fts5LexicalIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), "rust rust rust tokio").unwrap();
        index.upsert(&entry("b", "u1", "shared"), "rust and many other unrelated words here").unwrap();

        let hits = index.search("u1", None, "rust tokio", 10).unwrap();
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[0].1, 1.0);
        assert!(hits[1].1 > 0.0 && hits[1].1 < 1.0);
    }

    #[test]
    fn owner_and_namespace_filters_apply() {
        let index = Fts5LexicalIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "work"), "deadline friday").unwrap();
        index.upsert(&entry("b", "u2", "work"), "deadline friday").unwrap();
        index.upsert(&entry("c", "u1", "home"), "deadline friday").unwrap();

        let hits = index
            .search("u1", Some(&["work".to_string()]), "deadline", 10)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.0.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn upsert_replaces_and_remove_deletes() {
        let index = Fts5LexicalIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), "old words").unwrap();
        index.upsert(&entry("a", "u1", "shared"), "new words").unwrap();
        assert!(index.search("u1", None, "old", 10).unwrap().is_empty());
        assert_eq!(index.search("u1", None, "new", 10).unwrap().len(), 1);

        assert_eq!(index.remove("a").unwrap(), 1);
        assert_eq!(index.remove("a").unwrap(), 0);
        assert!(index.search("u1", None, "new", 10).unwrap().is_empty());
    }

    #[test]
    fn punctuation_only_query_matches_nothing() {
        let index = Fts5LexicalIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), "anything").unwrap();
        assert!(index.search("u1", None, "?? !!", 10).unwrap().is_empty());
    }

    #[test]
    fn test_escape_fts_query() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(escape_fts_query("say \"hi\""), "\"say\" OR \"hi\"");
        assert_eq!(escape_fts_query("  "), "");
        assert_eq!(escape_fts_query("AND OR NOT"), "\"AND\" OR \"OR\" OR \"NOT\"");
    }
}
