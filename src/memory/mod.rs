pub mod backup;
pub mod coordinator;
pub mod graph;
pub mod lexical;
pub mod records;
pub mod search;
pub mod types;
pub mod vector;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Identity of the record an index row belongs to.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry<'a> {
    pub record_id: &'a str,
    pub owner_id: &'a str,
    pub namespace: &'a str,
}

/// Append `AND namespace IN (...)` for an optional namespace set.
///
/// An empty set matches nothing rather than everything.
pub(crate) fn push_namespace_filter(
    sql: &mut String,
    args: &mut Vec<rusqlite::types::Value>,
    namespaces: Option<&[String]>,
) {
    if let Some(namespaces) = namespaces {
        if namespaces.is_empty() {
            sql.push_str(" AND 0");
            return;
        }
        let placeholders = vec!["?"; namespaces.len()].join(", ");
        sql.push_str(&format!(" AND namespace IN ({placeholders})"));
        args.extend(
            namespaces
                .iter()
                .map(|ns| rusqlite::types::Value::Text(ns.clone())),
        );
    }
}
