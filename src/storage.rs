//! Object storage for uploaded files.
//!
//! Files go straight from the uploader to an S3-compatible bucket (R2,
//! MinIO, S3) through a presigned `PUT` URL. The service only issues the
//! URL; it never proxies file bytes.
//!
//! - [`S3Storage`] signs URLs locally with AWS Signature V4 query-string
//!   authentication (`hmac` + `sha2`, no AWS SDK).
//! - [`GatewayStorage`] asks a running `dossier serve` for the URL through
//!   `POST /upload-url`, so clients never hold bucket credentials.
//!
//! Object keys are `{owner}/{21-char random suffix}-{filename}`; the public
//! read URL is `{public_base_url}/{key}`.
//!
//! Credentials come from `STORAGE_ACCESS_KEY_ID` and
//! `STORAGE_SECRET_ACCESS_KEY`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;
use crate::pipeline::UpstreamError;

type HmacSha256 = Hmac<Sha256>;

const KEY_SUFFIX_LEN: usize = 21;
const KEY_ALPHABET: &[u8; 64] =
    b"useandom-26T198340PX75pxJACKVERYMINDBUSHWOLF_GQZbfghjklqvwyzrict";

/// Where to send file bytes and where they can be read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteTarget {
    /// Presigned `PUT` URL.
    pub url: String,
    /// Public read URL of the stored object.
    #[serde(rename = "fileUrl")]
    pub file_url: String,
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn request_write_target(
        &self,
        owner_id: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<WriteTarget>;

    async fn put_object(&self, target: &WriteTarget, content_type: &str, body: Vec<u8>)
        -> Result<()>;
}

/// Build a fresh object key for `filename` owned by `owner_id`.
pub fn object_key(owner_id: &str, filename: &str) -> String {
    format!("{}/{}-{}", owner_id, random_suffix(), filename)
}

fn random_suffix() -> String {
    // Bytes 6 and 8 of a v4 UUID carry version and variant bits.
    let random: Vec<u8> = (0..2)
        .flat_map(|_| {
            let id = uuid::Uuid::new_v4();
            id.as_bytes()
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != 6 && *i != 8)
                .map(|(_, b)| *b)
                .collect::<Vec<_>>()
        })
        .collect();
    random
        .iter()
        .take(KEY_SUFFIX_LEN)
        .map(|b| KEY_ALPHABET[(*b & 63) as usize] as char)
        .collect()
}

fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

async fn put_to_target(
    client: &reqwest::Client,
    target: &WriteTarget,
    content_type: &str,
    body: Vec<u8>,
) -> Result<()> {
    let resp = client
        .put(&target.url)
        .header("Content-Type", content_type)
        .body(body)
        .send()
        .await
        .map_err(|e| UpstreamError::new("storage", e.to_string()))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(UpstreamError::new(
            "storage",
            format!(
                "PUT failed (HTTP {}): {}",
                status,
                text.chars().take(500).collect::<String>()
            ),
        )
        .into());
    }
    Ok(())
}

struct StorageCredentials {
    access_key_id: String,
    secret_access_key: String,
}

impl StorageCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("STORAGE_ACCESS_KEY_ID")
            .context("STORAGE_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("STORAGE_SECRET_ACCESS_KEY")
            .context("STORAGE_SECRET_ACCESS_KEY environment variable not set")?;
        Ok(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

/// Presigns uploads against an S3-compatible endpoint (path-style).
pub struct S3Storage {
    config: StorageConfig,
    creds: StorageCredentials,
    client: reqwest::Client,
}

impl S3Storage {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            creds: StorageCredentials::from_env()?,
            client: reqwest::Client::new(),
        })
    }

    fn host(&self) -> String {
        self.config
            .endpoint_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }

    fn scheme(&self) -> &'static str {
        if self.config.endpoint_url.starts_with("http://") {
            "http"
        } else {
            "https"
        }
    }

    /// Presigned `PUT` URL for `key`, valid for `url_expiry_secs` from `now`.
    pub fn presign_put(&self, key: &str, now: DateTime<Utc>) -> String {
        let host = self.host();
        let path = format!("/{}/{}", uri_encode(&self.config.bucket), encode_key(key));
        let query = presigned_query(
            "PUT",
            &host,
            &path,
            &self.config.region,
            &self.creds.access_key_id,
            &self.creds.secret_access_key,
            self.config.url_expiry_secs,
            now,
        );
        format!("{}://{}{}?{}", self.scheme(), host, path, query)
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.config.public_base_url.trim_end_matches('/'),
            encode_key(key)
        )
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn request_write_target(
        &self,
        owner_id: &str,
        filename: &str,
        _content_type: &str,
    ) -> Result<WriteTarget> {
        let key = object_key(owner_id, filename);
        tracing::debug!(key = %key, "issuing presigned upload URL");
        Ok(WriteTarget {
            url: self.presign_put(&key, Utc::now()),
            file_url: self.public_url(&key),
        })
    }

    async fn put_object(
        &self,
        target: &WriteTarget,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        put_to_target(&self.client, target, content_type, body).await
    }
}

/// Obtains write targets from a running service's `POST /upload-url`.
pub struct GatewayStorage {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GatewayStorage {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl ObjectStorage for GatewayStorage {
    async fn request_write_target(
        &self,
        owner_id: &str,
        filename: &str,
        content_type: &str,
    ) -> Result<WriteTarget> {
        let body = serde_json::json!({
            "ownerId": owner_id,
            "filename": filename,
            "contentType": content_type,
        });
        let mut request = self
            .client
            .post(format!("{}/upload-url", self.base_url))
            .json(&body);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| UpstreamError::new("storage", e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::new(
                "storage",
                format!("upload URL request failed (HTTP {}): {}", status, text),
            )
            .into());
        }
        resp.json::<WriteTarget>()
            .await
            .map_err(|e| UpstreamError::new("storage", format!("invalid upload URL reply: {}", e)).into())
    }

    async fn put_object(
        &self,
        target: &WriteTarget,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        put_to_target(&self.client, target, content_type, body).await
    }
}

// ============ AWS SigV4 Query-String Signing ============

/// Build the signed query string for a presigned request with an
/// unsigned payload and only `host` signed.
#[allow(clippy::too_many_arguments)]
fn presigned_query(
    method: &str,
    host: &str,
    canonical_uri: &str,
    region: &str,
    access_key_id: &str,
    secret_access_key: &str,
    expires_secs: u64,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);

    let mut params = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential".to_string(),
            format!("{}/{}", access_key_id, credential_scope),
        ),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), expires_secs.to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    params.sort_by(|a, b| a.0.cmp(&b.0));
    let canonical_querystring: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        method, canonical_uri, canonical_querystring, host
    );

    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(secret_access_key, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!("{}&X-Amz-Signature={}", canonical_querystring, signature)
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
