//! Embedding-similarity index over record content.
//!
//! One `record_vectors` row per content chunk. Similarity is computed with sqlite-vec's
//! `vec_distance_cosine`; a record scores as its best-matching chunk.

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter};

use crate::db::Db;
use crate::embedding::is_zero_vector;
use crate::memory::{embedding_to_bytes, push_namespace_filter, IndexEntry};

pub trait VectorIndex: Send + Sync {
    /// Replace every chunk vector of the record.
    fn upsert(&self, entry: &IndexEntry<'_>, chunks: &[Vec<f32>]) -> Result<()>;

    /// Drop all vectors of the record. Returns how many rows were removed.
    fn remove(&self, record_id: &str) -> Result<usize>;

    /// Owner-scoped nearest records as `(record_id, cosine_similarity)`, best first.
    /// `namespaces = None` searches every namespace of the owner.
    fn search(
        &self,
        owner: &str,
        namespaces: Option<&[String]>,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f64)>>;

    fn clear(&self) -> Result<()>;

    fn len(&self) -> Result<usize>;
}

#[derive(Clone)]
pub struct SqliteVectorIndex {
    db: Db,
}

impl SqliteVectorIndex {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn upsert(&self, entry: &IndexEntry<'_>, chunks: &[Vec<f32>]) -> Result<()> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM record_vectors WHERE record_id = ?1",
            params![entry.record_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_vectors \
                 (chunk_id, record_id, owner_id, namespace, chunk_index, embedding) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (idx, chunk) in chunks.iter().enumerate() {
                // A zero vector has no direction to compare against.
                if is_zero_vector(chunk) {
                    continue;
                }
                stmt.execute(params![
                    format!("{}#{idx}", entry.record_id),
                    entry.record_id,
                    entry.owner_id,
                    entry.namespace,
                    idx as i64,
                    embedding_to_bytes(chunk),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, record_id: &str) -> Result<usize> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "DELETE FROM record_vectors WHERE record_id = ?1",
            params![record_id],
        )?;
        Ok(n)
    }

    fn search(
        &self,
        owner: &str,
        namespaces: Option<&[String]>,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f64)>> {
        if limit == 0 || is_zero_vector(query) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT record_id, MIN(vec_distance_cosine(embedding, ?)) AS distance \
             FROM record_vectors WHERE owner_id = ?",
        );
        let mut args = vec![
            SqlValue::Blob(embedding_to_bytes(query).to_vec()),
            SqlValue::Text(owner.to_string()),
        ];
        push_namespace_filter(&mut sql, &mut args, namespaces);
        sql.push_str(" GROUP BY record_id ORDER BY distance ASC, record_id ASC LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));

        let conn = self.db.read()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<f64>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, distance)| {
                let cosine = 1.0 - distance?;
                cosine.is_finite().then_some((id, cosine))
            })
            .collect())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM record_vectors", [])?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let conn = self.db.read()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT record_id) FROM record_vectors",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[axis] = 1.0;
        v
    }

    fn entry<'a>(id: &'a str, owner: &'a str, ns: &'a str) -> IndexEntry<'a> {
        IndexEntry {
            record_id: id,
            owner_id: owner,
            namespace: ns,
        }
    }

    #[test]
    fn nearest_record_ranks_first() {
        let index = SqliteVectorIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), &[unit(0)]).unwrap();
        index.upsert(&entry("b", "u1", "shared"), &[unit(1)]).unwrap();

        let hits = index.search("u1", None, &unit(0), 10).unwrap();
        assert_eq!(hits[0].0, "a");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert!(hits[1].1.abs() < 1e-5);
    }

    #[test]
    fn best_chunk_wins_and_upsert_replaces() {
        let index = SqliteVectorIndex::new(Db::open_in_memory().unwrap());
        index
            .upsert(&entry("a", "u1", "shared"), &[unit(1), unit(0)])
            .unwrap();
        let hits = index.search("u1", None, &unit(0), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);

        index.upsert(&entry("a", "u1", "shared"), &[unit(2)]).unwrap();
        let hits = index.search("u1", None, &unit(0), 10).unwrap();
        assert!(hits[0].1.abs() < 1e-5);
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn search_is_owner_and_namespace_scoped() {
        let index = SqliteVectorIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "work"), &[unit(0)]).unwrap();
        index.upsert(&entry("b", "u2", "work"), &[unit(0)]).unwrap();
        index.upsert(&entry("c", "u1", "home"), &[unit(0)]).unwrap();

        let hits = index
            .search("u1", Some(&["work".to_string()]), &unit(0), 10)
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.0.as_str()).collect();
        assert_eq!(ids, vec!["a"]);

        assert!(index.search("u1", Some(&[]), &unit(0), 10).unwrap().is_empty());
    }

    #[test]
    fn zero_vectors_are_skipped() {
        let index = SqliteVectorIndex::new(Db::open_in_memory().unwrap());
        let zero = vec![0.0f32; EMBEDDING_DIM];
        index.upsert(&entry("a", "u1", "shared"), &[zero.clone()]).unwrap();
        assert_eq!(index.len().unwrap(), 0);
        assert!(index.search("u1", None, &zero, 10).unwrap().is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let index = SqliteVectorIndex::new(Db::open_in_memory().unwrap());
        index.upsert(&entry("a", "u1", "shared"), &[unit(0), unit(1)]).unwrap();
        index.upsert(&entry("b", "u1", "shared"), &[unit(1)]).unwrap();
        assert_eq!(index.remove("a").unwrap(), 2);
        assert_eq!(index.remove("a").unwrap(), 0);
        index.clear().unwrap();
        assert_eq!(index.len().unwrap(), 0);
    }
}
