use std::collections::HashMap;
use std::sync::Mutex;

use crate::documents::{Document, DocumentStore};
use crate::error::Result;

/// In-process document store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Document> {
        let documents = self.documents.lock().unwrap_or_else(|p| p.into_inner());
        Ok(documents.get(name).cloned().unwrap_or_default())
    }

    fn save(&self, name: &str, document: &Document) -> Result<()> {
        let mut documents = self.documents.lock().unwrap_or_else(|p| p.into_inner());
        documents.insert(name.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load("rooms").unwrap().is_empty());

        let mut doc = Document::new();
        doc.insert("x".into(), serde_json::json!(1));
        store.save("rooms", &doc).unwrap();
        assert_eq!(store.load("rooms").unwrap(), doc);
    }
}
