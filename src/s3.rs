// src/s3.rs
//
// Black-box seam to the object store: the ObjectStore trait consumed by the
// workload engine, and its aws-sdk-s3 implementation. Every driver holds two
// instances with identical transport configuration - `svc` for measured work
// and `housekeeping` for prepare/clean traffic.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::config::S3Configuration;

/// Default part size when multipart is enabled but unset (5 MiB).
pub const DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Default number of concurrently in-flight parts.
pub const DEFAULT_MPU_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipartSpec {
    pub part_size: u64,
    pub concurrency: usize,
}

impl MultipartSpec {
    /// Replace unset fields with the platform defaults.
    pub fn normalized(self) -> MultipartSpec {
        MultipartSpec {
            part_size: if self.part_size == 0 {
                DEFAULT_PART_SIZE
            } else {
                self.part_size
            },
            concurrency: if self.concurrency == 0 {
                DEFAULT_MPU_CONCURRENCY
            } else {
                self.concurrency
            },
        }
    }
}

/// The five operations the load generator needs from an S3-compatible store,
/// plus the bucket lifecycle used by prepare and cleanup.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent: an already existing bucket is not an error.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()>;

    async fn put_object_multipart(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        spec: MultipartSpec,
    ) -> Result<()>;

    /// Returns the number of bytes fetched.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<u64>;

    /// Ranged parallel read; returns the number of bytes fetched.
    async fn get_object_multipart(
        &self,
        bucket: &str,
        key: &str,
        spec: MultipartSpec,
    ) -> Result<u64>;

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Deletes any remaining objects first, then the bucket itself.
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;
}

/// aws-sdk-s3 backed implementation.
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(config: &S3Configuration) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "gosbench",
        );
        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if !config.timeout.is_zero() {
            builder = builder.timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(config.timeout)
                    .build(),
            );
        }
        if config.skip_ssl_verify {
            warn!("skipSSLverify is set but this client always verifies certificates");
        }
        if !config.proxy_host.is_empty() {
            warn!(proxy = %config.proxy_host, "proxyHost is set but this client connects directly");
        }
        S3Store {
            client: Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.create_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_bucket_already_exists()
                    || service_err.is_bucket_already_owned_by_you()
                {
                    debug!(bucket, "bucket already exists");
                    Ok(())
                } else {
                    Err(anyhow!(service_err)
                        .context(format!("could not create bucket {}", bucket)))
                }
            }
        }
    }

    async fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .with_context(|| format!("failed to upload object {} to bucket {}", key, bucket))?;
        Ok(())
    }

    async fn put_object_multipart(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        spec: MultipartSpec,
    ) -> Result<()> {
        let spec = spec.normalized();
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to start multipart upload of {}", key))?;
        let upload_id = created
            .upload_id()
            .context("multipart upload id missing")?
            .to_string();

        let chunks: Vec<(i32, Vec<u8>)> = data
            .chunks(spec.part_size as usize)
            .enumerate()
            .map(|(index, chunk)| (index as i32 + 1, chunk.to_vec()))
            .collect();

        let uploads = stream::iter(chunks.into_iter().map(|(part_number, body)| {
            let client = self.client.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            async move {
                let part = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .with_context(|| format!("failed to upload part {} of {}", part_number, key))?;
                Ok::<CompletedPart, anyhow::Error>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .set_e_tag(part.e_tag().map(str::to_string))
                        .build(),
                )
            }
        }))
        .buffer_unordered(spec.concurrency.max(1));

        let mut parts: Vec<CompletedPart> = match uploads.try_collect().await {
            Ok(parts) => parts,
            Err(err) => {
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                return Err(err);
            }
        };
        parts.sort_by_key(|part| part.part_number().unwrap_or(0));

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("failed to complete multipart upload of {}", key))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to read object {} from bucket {}", key, bucket))?;
        let body = response
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of object {}", key))?;
        Ok(body.into_bytes().len() as u64)
    }

    async fn get_object_multipart(
        &self,
        bucket: &str,
        key: &str,
        spec: MultipartSpec,
    ) -> Result<u64> {
        let spec = spec.normalized();
        let first = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes=0-{}", spec.part_size - 1))
            .send()
            .await
            .with_context(|| format!("failed ranged read of object {}", key))?;
        let total_size = first.content_range().and_then(parse_total_size);
        let mut fetched = first
            .body
            .collect()
            .await
            .with_context(|| format!("failed to read body of object {}", key))?
            .into_bytes()
            .len() as u64;

        // Servers that ignore the Range header return the whole object in
        // the first response; nothing left to fetch then.
        let Some(total) = total_size else {
            return Ok(fetched);
        };

        let mut ranges = Vec::new();
        let mut start = spec.part_size;
        while start < total {
            let end = (start + spec.part_size - 1).min(total - 1);
            ranges.push((start, end));
            start = end + 1;
        }

        let remaining = stream::iter(ranges.into_iter().map(|(start, end)| {
            let client = self.client.clone();
            let bucket = bucket.to_string();
            let key = key.to_string();
            async move {
                let part = client
                    .get_object()
                    .bucket(&bucket)
                    .key(&key)
                    .range(format!("bytes={}-{}", start, end))
                    .send()
                    .await
                    .with_context(|| format!("failed ranged read of object {}", key))?;
                let body = part
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("failed to read body of object {}", key))?;
                Ok::<u64, anyhow::Error>(body.into_bytes().len() as u64)
            }
        }))
        .buffer_unordered(spec.concurrency.max(1))
        .try_fold(0u64, |acc, n| async move { Ok(acc + n) })
        .await?;

        Ok(fetched + remaining)
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .send()
            .await
            .with_context(|| format!("failed to list bucket {} with prefix {}", bucket, prefix))?;
        Ok(response
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("failed to delete object {} from bucket {}", key, bucket))?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.with_context(|| format!("failed to list bucket {} for deletion", bucket))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                if let Err(err) = self
                    .client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                {
                    warn!(bucket, key, error = %err, "failed to delete object during bucket removal");
                }
            }
        }
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .with_context(|| format!("failed to delete bucket {}", bucket))?;
        Ok(())
    }
}

/// Extract the total object size from a Content-Range header value like
/// `bytes 0-499/12345`.
fn parse_total_size(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.parse().ok()
}
