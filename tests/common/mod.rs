// tests/common/mod.rs
//
// Shared test support: an in-memory object store standing in for an S3
// endpoint. Every operation succeeds; names and counts are tracked so tests
// can assert on seeding, measurement and cleanup behavior.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use gosbench::s3::{MultipartSpec, ObjectStore};

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashSet<(String, String)>>,
    buckets: Mutex<HashSet<String>>,
    pub puts: AtomicU64,
    pub multipart_puts: AtomicU64,
    pub gets: AtomicU64,
    pub lists: AtomicU64,
    pub deletes: AtomicU64,
}

impl MemoryStore {
    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().unwrap().insert(bucket.to_string());
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, _data: &[u8]) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn put_object_multipart(
        &self,
        bucket: &str,
        key: &str,
        _data: &[u8],
        _spec: MultipartSpec,
    ) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.multipart_puts.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn get_object(&self, _bucket: &str, _key: &str) -> Result<u64> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(1024)
    }

    async fn get_object_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        _spec: MultipartSpec,
    ) -> Result<u64> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(1024)
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(b, key)| b == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().unwrap().remove(bucket);
        self.objects.lock().unwrap().retain(|(b, _)| b != bucket);
        Ok(())
    }
}
