use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying: timeouts, throttling, 5xx.
    Transient,
    /// Retrying will not help.
    Permanent,
    NotFound,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: i64,
    pub etag: String,
}

/// The exact surface the upload worker needs from an S3-compatible service.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<String, StoreError>;

    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String, StoreError>;

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<String, StoreError>;

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError>;

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<String, StoreError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}

// --- S3 implementation ---

pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub async fn connect(config: &Config) -> Result<Self> {
        let region = config
            .s3_region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        #[allow(deprecated)]
        let mut config_loader = aws_config::from_env().region(aws_config::Region::new(region));

        let access_key = config.s3_access_key.as_deref().map(str::trim);
        let secret_key = config.s3_secret_key.as_deref().map(str::trim);
        if let (Some(ak), Some(sk)) = (access_key, secret_key) {
            let creds = Credentials::new(ak.to_string(), sk.to_string(), None, None, "static");
            config_loader = config_loader.credentials_provider(SharedCredentialsProvider::new(creds));
        } else if access_key.is_some() || secret_key.is_some() {
            return Err(anyhow::anyhow!(
                "S3 credentials incomplete: both access key and secret key must be provided"
            ));
        }

        let sdk_config = config_loader.load().await;

        let mut client_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = config.s3_endpoint.as_deref() {
            client_builder = client_builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(Self {
            client: Client::from_conf(client_builder.build()),
        })
    }
}

fn classify_sdk_error<E>(op: &str, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            let code = ctx.err().code().unwrap_or("Unknown");
            let message = format!(
                "{op} failed: {code}: {}",
                ctx.err().message().unwrap_or("no message")
            );
            if status == 404 || code == "NoSuchKey" || code == "NotFound" {
                StoreError::not_found(message)
            } else if status >= 500
                || status == 429
                || code == "SlowDown"
                || code == "RequestTimeout"
                || code == "Throttling"
                || code == "ThrottlingException"
            {
                StoreError::transient(message)
            } else {
                StoreError::permanent(message)
            }
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::transient(format!("{op} failed: {err}"))
        }
        _ => StoreError::permanent(format!("{op} failed: {err}")),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StoreError::permanent("create_multipart_upload returned no upload id"))
    }

    async fn put_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String, StoreError> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body.to_vec()))
            .send()
            .await
            .map_err(|e| classify_sdk_error("upload_part", e))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::permanent(format!("part {part_number} returned no etag")))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<String, StoreError> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();
        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", e))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify_sdk_error("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<String, StoreError> {
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body.to_vec()))
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_object", e))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("head_object", e))?;
        Ok(ObjectStat {
            size: output.content_length().unwrap_or(0),
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete_object", e))?;
        Ok(())
    }
}

// --- In-memory implementation ---

/// HashMap-backed store for the test suite. Supports injecting transient
/// part failures and counts calls so tests can assert on protocol usage.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, MultipartState>,
    next_upload_id: u64,
    next_etag: u64,
    transient_part_failures: HashMap<i32, u32>,
    put_object_calls: u64,
    initiated_uploads: u64,
    abort_calls: u64,
    delete_calls: u64,
    completed_part_counts: Vec<usize>,
}

struct MultipartState {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, (String, Vec<u8>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `times` uploads of `part_number` fail with a transient error.
    pub fn fail_part_transiently(&self, part_number: i32, times: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.transient_part_failures.insert(part_number, times);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    pub fn put_object_calls(&self) -> u64 {
        self.inner.lock().unwrap().put_object_calls
    }

    pub fn initiated_uploads(&self) -> u64 {
        self.inner.lock().unwrap().initiated_uploads
    }

    pub fn abort_calls(&self) -> u64 {
        self.inner.lock().unwrap().abort_calls
    }

    pub fn delete_calls(&self) -> u64 {
        self.inner.lock().unwrap().delete_calls
    }

    pub fn completed_part_counts(&self) -> Vec<usize> {
        self.inner.lock().unwrap().completed_part_counts.clone()
    }

    /// Uploads initiated but neither completed nor aborted.
    pub fn open_upload_count(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }
}

impl MemoryInner {
    fn mint_etag(&mut self) -> String {
        self.next_etag += 1;
        format!("\"mem-{}\"", self.next_etag)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn initiate_multipart(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_upload_id += 1;
        inner.initiated_uploads += 1;
        let upload_id = format!("upload-{}", inner.next_upload_id);
        inner.uploads.insert(
            upload_id.clone(),
            MultipartState {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn put_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: &[u8],
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(remaining) = inner.transient_part_failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::transient(format!(
                    "injected transient failure for part {part_number}"
                )));
            }
        }
        let etag = inner.mint_etag();
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::not_found(format!("unknown upload id '{upload_id}'")))?;
        upload.parts.insert(part_number, (etag.clone(), body.to_vec()));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let upload = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::not_found(format!("unknown upload id '{upload_id}'")))?;

        let mut body = Vec::new();
        for (index, (part_number, etag)) in parts.iter().enumerate() {
            if *part_number != index as i32 + 1 {
                return Err(StoreError::permanent(format!(
                    "part numbers not contiguous at position {index}"
                )));
            }
            let Some((stored_etag, data)) = upload.parts.get(part_number) else {
                return Err(StoreError::permanent(format!(
                    "part {part_number} was never uploaded"
                )));
            };
            if stored_etag != etag {
                return Err(StoreError::permanent(format!(
                    "etag mismatch for part {part_number}"
                )));
            }
            body.extend_from_slice(data);
        }

        inner.completed_part_counts.push(parts.len());
        let etag = inner.mint_etag();
        inner.objects.insert((upload.bucket, upload.key), body);
        Ok(etag)
    }

    async fn abort_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.abort_calls += 1;
        inner.uploads.remove(upload_id);
        Ok(())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<String, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.put_object_calls += 1;
        inner
            .objects
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        let etag = inner.mint_etag();
        Ok(etag)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectStat, StoreError> {
        let inner = self.inner.lock().unwrap();
        match inner.objects.get(&(bucket.to_string(), key.to_string())) {
            Some(body) => Ok(ObjectStat {
                size: body.len() as i64,
                etag: "\"mem\"".to_string(),
            }),
            None => Err(StoreError::not_found(format!("no such key '{key}'"))),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.delete_calls += 1;
        inner.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
