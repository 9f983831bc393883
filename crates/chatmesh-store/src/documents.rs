//! The load/save document interface and its SQLite implementation.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A stored document: a JSON object keyed by string.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Durable named documents. `load` of a name never saved yields an empty
/// mapping.
pub trait DocumentStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Document>;
    fn save(&self, name: &str, document: &Document) -> Result<()>;
}

impl DocumentStore for Database {
    fn load(&self, name: &str) -> Result<Document> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM documents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            None => Ok(Document::new()),
            Some(text) => match serde_json::from_str(&text)? {
                serde_json::Value::Object(map) => Ok(map),
                _ => Err(StoreError::NotAMapping(name.to_string())),
            },
        }
    }

    fn save(&self, name: &str, document: &Document) -> Result<()> {
        let body = serde_json::to_string(document)?;
        self.conn().execute(
            "INSERT INTO documents (name, body, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![name, body, Utc::now().to_rfc3339()],
        )?;
        tracing::debug!(document = name, bytes = body.len(), "saved document");
        Ok(())
    }
}

/// Load a document and deserialize it into a typed table.
pub fn load_typed<T: DeserializeOwned>(store: &dyn DocumentStore, name: &str) -> Result<T> {
    let document = store.load(name)?;
    Ok(serde_json::from_value(serde_json::Value::Object(document))?)
}

/// Serialize a typed table and save it as a document.
pub fn save_typed<T: Serialize>(store: &dyn DocumentStore, name: &str, value: &T) -> Result<()> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => store.save(name, &map),
        _ => Err(StoreError::NotAMapping(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn missing_document_is_empty() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load("rooms").unwrap().is_empty());
    }

    #[test]
    fn save_then_load_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let mut doc = Document::new();
        doc.insert("alice".into(), json!({"salt": "00", "hash": "11"}));
        db.save("users", &doc).unwrap();

        doc.insert("bob".into(), json!({"salt": "22", "hash": "33"}));
        db.save("users", &doc).unwrap();

        let loaded = db.load("users").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["bob"]["hash"], "33");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.db");
        {
            let db = Database::open_at(&path).unwrap();
            let table: BTreeMap<String, u32> = [("x".to_string(), 1)].into();
            save_typed(&db, "counters", &table).unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        let table: BTreeMap<String, u32> = load_typed(&db, "counters").unwrap();
        assert_eq!(table.get("x"), Some(&1));
    }

    #[test]
    fn non_mapping_rejected() {
        let db = Database::open_in_memory().unwrap();
        let err = save_typed(&db, "list", &vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, StoreError::NotAMapping(_)));
    }
}
