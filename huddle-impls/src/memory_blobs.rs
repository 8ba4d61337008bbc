use async_trait::async_trait;
use dashmap::DashMap;
use huddle_core::{BlobError, BlobStore};

/// Keeps transferred file contents in process memory
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, reference: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
        self.blobs.insert(reference.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .get(reference)
            .map(|b| b.clone())
            .ok_or_else(|| BlobError::NotFound {
                reference: reference.to_string(),
            })
    }

    async fn delete(&self, reference: &str) -> Result<(), BlobError> {
        self.blobs.remove(reference);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn deleted_blobs_are_gone() {
        let blobs = MemoryBlobStore::new();

        blobs.put("ref-1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(blobs.get("ref-1").await.unwrap(), vec![1, 2, 3]);

        blobs.delete("ref-1").await.unwrap();
        assert!(blobs.get("ref-1").await.is_err());
    }
}
