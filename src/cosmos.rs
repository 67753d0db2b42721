//! Cosmos DB Document Store Implementation
//!
//! Production backend speaking the Cosmos DB REST surface directly: master-key
//! request signing, single-partition point operations, and stored-procedure
//! execution for lock arbitration. Bootstrap is idempotent; every step
//! tolerates a pre-existing resource so any number of front-end processes can
//! race through initialization.
//!
//! Every round-trip emits one tracing event carrying the operation name, the
//! request-unit charge, the HTTP status and the elapsed time.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::json;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::{ConsistencyLevel, ProviderConfig, DEFAULT_CONTAINER_TTL};
use crate::document::{ContentDocument, LockDocument};
use crate::traits::{
    DeleteOutcome, DocumentStore, InsertLockOutcome, ReplaceOutcome, SessionStoreError,
    StoreResult, TryLockReply,
};

const API_VERSION: &str = "2018-12-31";

/// How much of an error body to keep in surfaced errors.
const ERROR_BODY_LIMIT: usize = 512;

/// Server-side conflict arbitration: check-absence-then-insert, atomic within
/// the lock's partition. The point-write in acquisition phase 1 cannot make
/// that guarantee, which is why contended acquisitions fall through to this
/// script.
pub(crate) const TRY_LOCK_SCRIPT: &str = r#"function tryLock(lockId, nowUtc, ttlSeconds) {
    var context = getContext();
    var container = context.getCollection();
    var response = context.getResponse();
    var query = {
        query: 'SELECT * FROM c WHERE c.id = @id',
        parameters: [{ name: '@id', value: lockId }]
    };
    var accepted = container.queryDocuments(container.getSelfLink(), query, function (err, docs) {
        if (err) throw err;
        if (docs.length > 0) {
            var held = docs[0];
            response.setBody({ locked: false, etag: held._etag, createdDate: held.CreatedDate });
        } else {
            var lock = { id: lockId, CreatedDate: nowUtc, ttl: ttlSeconds };
            var created = container.createDocument(container.getSelfLink(), lock, function (createErr, doc) {
                if (createErr) throw createErr;
                response.setBody({ locked: true, etag: doc._etag, createdDate: doc.CreatedDate });
            });
            if (!created) throw new Error('lock createDocument was not accepted');
        }
    });
    if (!accepted) throw new Error('lock queryDocuments was not accepted');
}"#;

/// Stored-procedure name: `tryLock_` plus the first 20 hex characters of the
/// SHA-1 of the script body. Upgraded script bodies get new names, so
/// replacement is collision-free and registration stays create-if-absent.
pub(crate) fn try_lock_script_name() -> String {
    let digest = hex::encode(Sha1::digest(TRY_LOCK_SCRIPT.as_bytes()));
    format!("tryLock_{}", &digest[..20])
}

struct CosmosResponse {
    status: u16,
    sub_status: u32,
    etag: Option<String>,
    body: String,
}

/// Cosmos DB-backed session container
pub struct CosmosDocumentStore {
    http: reqwest::Client,
    endpoint: String,
    key: Vec<u8>,
    database_id: String,
    container_id: String,
    consistency: ConsistencyLevel,
    max_rate_limit_wait: Duration,
    script_name: String,
}

impl CosmosDocumentStore {
    /// Build a signed client for the configured account. The HTTP client's
    /// request timeout and the rate-limit retry budget are both half the
    /// lock TTL, so no single store operation can outlast the lock it
    /// protects. [`bootstrap`](DocumentStore::bootstrap) still has to run
    /// before first use.
    pub fn connect(config: &ProviderConfig) -> StoreResult<Self> {
        let key = BASE64
            .decode(config.account_key.as_bytes())
            .map_err(|_| SessionStoreError::Configuration("account key is not valid base64".into()))?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| SessionStoreError::Transport {
                operation: "connect",
                message: err.to_string(),
            })?;

        let store = Self {
            http,
            endpoint: config.account_endpoint.trim_end_matches('/').to_string(),
            key,
            database_id: config.database_id.clone(),
            container_id: config.container_id.clone(),
            consistency: config.consistency_level,
            max_rate_limit_wait: config.max_retry_wait_on_rate_limited(),
            script_name: try_lock_script_name(),
        };
        info!(
            endpoint = %store.endpoint,
            database = %store.database_id,
            container = %store.container_id,
            "cosmos session store client ready"
        );
        Ok(store)
    }

    fn container_link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database_id, self.container_id)
    }

    fn document_link(&self, id: &str) -> String {
        format!("{}/docs/{}", self.container_link(), id)
    }

    fn document_path(&self, id: &str) -> String {
        format!(
            "dbs/{}/colls/{}/docs/{}",
            encode_uri_component(&self.database_id),
            encode_uri_component(&self.container_id),
            encode_uri_component(id)
        )
    }

    /// Master-key authorization token for one request.
    fn auth_token(&self, verb: &str, resource_type: &str, resource_link: &str, date: &str) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n\n",
            verb.to_lowercase(),
            resource_type,
            resource_link,
            date
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        encode_uri_component(&format!("type=master&ver=1.0&sig={signature}"))
    }

    /// One signed request with bounded retry on rate limiting. Rebuilt per
    /// attempt: the date header participates in the signature.
    async fn execute(
        &self,
        op: &'static str,
        method: Method,
        resource_type: &'static str,
        resource_link: &str,
        path: &str,
        extra_headers: &[(&'static str, String)],
        body: Option<String>,
    ) -> StoreResult<CosmosResponse> {
        let mut waited = Duration::ZERO;
        loop {
            let date = Utc::now()
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string()
                .to_lowercase();
            let token = self.auth_token(method.as_str(), resource_type, resource_link, &date);

            let mut request = self
                .http
                .request(method.clone(), format!("{}/{}", self.endpoint, path))
                .header("authorization", token)
                .header("x-ms-date", date)
                .header("x-ms-version", API_VERSION);
            for (name, value) in extra_headers {
                request = request.header(*name, value);
            }
            if let Some(ref payload) = body {
                request = request
                    .header("content-type", "application/json")
                    .body(payload.clone());
            }

            let started = Instant::now();
            let response = request.send().await.map_err(|err| SessionStoreError::Transport {
                operation: op,
                message: err.to_string(),
            })?;

            let status = response.status().as_u16();
            let sub_status = header_u32(&response, "x-ms-substatus");
            let request_charge = header_f64(&response, "x-ms-request-charge");
            let retry_after = header_u64(&response, "x-ms-retry-after-ms");
            let etag = response
                .headers()
                .get("etag")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body_text = response.text().await.unwrap_or_default();
            let elapsed_ms = started.elapsed().as_millis() as u64;

            debug!(
                operation = op,
                status,
                sub_status,
                request_charge,
                elapsed_ms,
                "cosmos request"
            );

            if status == 429 {
                let backoff = Duration::from_millis(retry_after.unwrap_or(100));
                if waited + backoff > self.max_rate_limit_wait {
                    warn!(operation = op, waited_ms = waited.as_millis() as u64, "rate-limit retry budget exhausted");
                    return Err(SessionStoreError::RateLimited { operation: op });
                }
                waited += backoff;
                tokio::time::sleep(backoff).await;
                continue;
            }

            return Ok(CosmosResponse {
                status,
                sub_status,
                etag,
                body: body_text,
            });
        }
    }

    fn fatal(op: &'static str, response: &CosmosResponse) -> SessionStoreError {
        let mut message = response.body.clone();
        if message.len() > ERROR_BODY_LIMIT {
            let mut end = ERROR_BODY_LIMIT;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        SessionStoreError::Store {
            operation: op,
            status: response.status,
            sub_status: response.sub_status,
            message,
        }
    }

    async fn create_database(&self) -> StoreResult<()> {
        let response = self
            .execute(
                "createDatabase",
                Method::POST,
                "dbs",
                "",
                "dbs",
                &[],
                Some(json!({ "id": self.database_id }).to_string()),
            )
            .await?;
        match response.status {
            201 => {
                info!(database = %self.database_id, "database created");
                Ok(())
            }
            409 => Ok(()),
            _ => Err(Self::fatal("createDatabase", &response)),
        }
    }

    async fn create_container(&self) -> StoreResult<()> {
        // No field is ever queried by equality filter; primary-key lookup
        // suffices, so indexing is disabled on every path.
        let body = json!({
            "id": self.container_id,
            "partitionKey": { "paths": ["/id"], "kind": "Hash" },
            "indexingPolicy": {
                "indexingMode": "consistent",
                "automatic": true,
                "includedPaths": [],
                "excludedPaths": [{ "path": "/*" }]
            },
            "defaultTtl": DEFAULT_CONTAINER_TTL.as_secs()
        });
        let link = format!("dbs/{}", self.database_id);
        let path = format!("dbs/{}/colls", encode_uri_component(&self.database_id));
        let response = self
            .execute(
                "createContainer",
                Method::POST,
                "colls",
                &link,
                &path,
                &[],
                Some(body.to_string()),
            )
            .await?;
        match response.status {
            201 => {
                info!(container = %self.container_id, "container created");
                Ok(())
            }
            409 => Ok(()),
            _ => Err(Self::fatal("createContainer", &response)),
        }
    }

    async fn create_try_lock_script(&self) -> StoreResult<()> {
        let body = json!({ "id": self.script_name, "body": TRY_LOCK_SCRIPT });
        let link = self.container_link();
        let path = format!(
            "dbs/{}/colls/{}/sprocs",
            encode_uri_component(&self.database_id),
            encode_uri_component(&self.container_id)
        );
        let response = self
            .execute(
                "createTryLockScript",
                Method::POST,
                "sprocs",
                &link,
                &path,
                &[],
                Some(body.to_string()),
            )
            .await?;
        match response.status {
            201 => {
                info!(script = %self.script_name, "try-lock script registered");
                Ok(())
            }
            409 => Ok(()),
            _ => Err(Self::fatal("createTryLockScript", &response)),
        }
    }
}

#[async_trait]
impl DocumentStore for CosmosDocumentStore {
    fn backend_name(&self) -> &'static str {
        "Cosmos"
    }

    async fn bootstrap(&self) -> StoreResult<()> {
        self.create_database().await?;
        self.create_container().await?;
        self.create_try_lock_script().await
    }

    async fn read_content(&self, id: &str) -> StoreResult<Option<ContentDocument>> {
        let link = self.document_link(id);
        let headers = [
            ("x-ms-documentdb-partitionkey", partition_key(id)),
            (
                "x-ms-consistency-level",
                self.consistency.header_value().to_string(),
            ),
        ];
        let response = self
            .execute(
                "readContent",
                Method::GET,
                "docs",
                &link,
                &self.document_path(id),
                &headers,
                None,
            )
            .await?;
        match response.status {
            200 => {
                let mut doc: ContentDocument = serde_json::from_str(&response.body)?;
                if doc.etag.is_none() {
                    doc.etag = response.etag;
                }
                Ok(Some(doc))
            }
            404 => Ok(None),
            _ => Err(Self::fatal("readContent", &response)),
        }
    }

    async fn upsert_content(&self, doc: &ContentDocument) -> StoreResult<()> {
        let link = self.container_link();
        let path = format!(
            "dbs/{}/colls/{}/docs",
            encode_uri_component(&self.database_id),
            encode_uri_component(&self.container_id)
        );
        let headers = [
            ("x-ms-documentdb-partitionkey", partition_key(&doc.id)),
            ("x-ms-documentdb-is-upsert", "true".to_string()),
            // The written document is never needed back.
            ("prefer", "return=minimal".to_string()),
        ];
        let response = self
            .execute(
                "upsertContent",
                Method::POST,
                "docs",
                &link,
                &path,
                &headers,
                Some(serde_json::to_string(doc)?),
            )
            .await?;
        match response.status {
            200 | 201 | 204 => Ok(()),
            _ => Err(Self::fatal("upsertContent", &response)),
        }
    }

    async fn replace_content_if_match(
        &self,
        etag: &str,
        doc: &ContentDocument,
        consistency: ConsistencyLevel,
    ) -> StoreResult<ReplaceOutcome> {
        let link = self.document_link(&doc.id);
        let headers = [
            ("x-ms-documentdb-partitionkey", partition_key(&doc.id)),
            ("if-match", etag.to_string()),
            ("x-ms-consistency-level", consistency.header_value().to_string()),
            ("prefer", "return=minimal".to_string()),
        ];
        let response = self
            .execute(
                "replaceContent",
                Method::PUT,
                "docs",
                &link,
                &self.document_path(&doc.id),
                &headers,
                Some(serde_json::to_string(doc)?),
            )
            .await?;
        match response.status {
            200 | 204 => Ok(ReplaceOutcome::Replaced),
            404 => Ok(ReplaceOutcome::Missing),
            412 => Ok(ReplaceOutcome::EtagMismatch),
            _ => Err(Self::fatal("replaceContent", &response)),
        }
    }

    async fn insert_lock(&self, doc: &LockDocument) -> StoreResult<InsertLockOutcome> {
        let link = self.container_link();
        let path = format!(
            "dbs/{}/colls/{}/docs",
            encode_uri_component(&self.database_id),
            encode_uri_component(&self.container_id)
        );
        let headers = [
            ("x-ms-documentdb-partitionkey", partition_key(&doc.id)),
            ("prefer", "return=minimal".to_string()),
        ];
        let response = self
            .execute(
                "insertLock",
                Method::POST,
                "docs",
                &link,
                &path,
                &headers,
                Some(serde_json::to_string(doc)?),
            )
            .await?;
        match response.status {
            201 | 204 => {
                let etag = response.etag.ok_or_else(|| SessionStoreError::Store {
                    operation: "insertLock",
                    status: response.status,
                    sub_status: response.sub_status,
                    message: "created lock response carried no etag".into(),
                })?;
                Ok(InsertLockOutcome::Created {
                    etag,
                    created_date: doc.created_date,
                })
            }
            409 => Ok(InsertLockOutcome::Held),
            _ => Err(Self::fatal("insertLock", &response)),
        }
    }

    async fn try_lock(
        &self,
        lock_id: &str,
        now: DateTime<Utc>,
        ttl_secs: i64,
    ) -> StoreResult<TryLockReply> {
        let link = format!("{}/sprocs/{}", self.container_link(), self.script_name);
        let path = format!(
            "dbs/{}/colls/{}/sprocs/{}",
            encode_uri_component(&self.database_id),
            encode_uri_component(&self.container_id),
            encode_uri_component(&self.script_name)
        );
        let headers = [("x-ms-documentdb-partitionkey", partition_key(lock_id))];
        let args = json!([lock_id, now, ttl_secs]);
        let response = self
            .execute(
                "tryLock",
                Method::POST,
                "sprocs",
                &link,
                &path,
                &headers,
                Some(args.to_string()),
            )
            .await?;
        match response.status {
            200 => Ok(serde_json::from_str(&response.body)?),
            _ => Err(Self::fatal("tryLock", &response)),
        }
    }

    async fn delete_document(
        &self,
        id: &str,
        if_match: Option<&str>,
    ) -> StoreResult<DeleteOutcome> {
        let link = self.document_link(id);
        let mut headers = vec![("x-ms-documentdb-partitionkey", partition_key(id))];
        if let Some(etag) = if_match {
            headers.push(("if-match", etag.to_string()));
        }
        let response = self
            .execute(
                "deleteDocument",
                Method::DELETE,
                "docs",
                &link,
                &self.document_path(id),
                &headers,
                None,
            )
            .await?;
        match response.status {
            204 => Ok(DeleteOutcome::Deleted),
            404 => Ok(DeleteOutcome::NotFound),
            412 => Ok(DeleteOutcome::EtagMismatch),
            _ => Err(Self::fatal("deleteDocument", &response)),
        }
    }
}

/// Partition-key header value: a one-element JSON array holding the id.
fn partition_key(id: &str) -> String {
    json!([id]).to_string()
}

fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            }
        }
    }
    out
}

fn header_u32(response: &reqwest::Response, name: &str) -> u32 {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn header_f64(response: &reqwest::Response, name: &str) -> Option<f64> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_name_is_deterministic() {
        let name = try_lock_script_name();
        assert_eq!(name, try_lock_script_name());
        assert!(name.starts_with("tryLock_"));
        let digest = name.strip_prefix("tryLock_").unwrap();
        assert_eq!(digest.len(), 20);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn partition_key_is_single_element_array() {
        assert_eq!(partition_key("abc"), r#"["abc"]"#);
        assert_eq!(partition_key("a\"b"), r#"["a\"b"]"#);
    }

    #[test]
    fn uri_component_encoding() {
        assert_eq!(encode_uri_component("plain-id_0.9~"), "plain-id_0.9~");
        assert_eq!(encode_uri_component("a b+c/="), "a%20b%2Bc%2F%3D");
    }

    #[test]
    fn auth_token_is_url_safe() {
        let store = CosmosDocumentStore {
            http: reqwest::Client::new(),
            endpoint: "https://unit.documents.azure.com".into(),
            key: b"0123456789abcdef0123456789abcdef".to_vec(),
            database_id: "db".into(),
            container_id: "SessionStore".into(),
            consistency: ConsistencyLevel::Strong,
            max_rate_limit_wait: Duration::from_secs(15),
            script_name: try_lock_script_name(),
        };
        let token = store.auth_token("GET", "docs", "dbs/db/colls/SessionStore/docs/s1", "mon, 01 jan 2026 00:00:00 gmt");
        assert!(token.starts_with("type%3Dmaster%26ver%3D1.0%26sig%3D"));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains(' '));
    }

    #[test]
    fn script_queries_before_creating() {
        // The script body is part of the persisted deployment surface; the
        // name test above pins its hash indirectly, this pins the two calls
        // the arbitration depends on.
        assert!(TRY_LOCK_SCRIPT.contains("queryDocuments"));
        assert!(TRY_LOCK_SCRIPT.contains("createDocument"));
        assert!(TRY_LOCK_SCRIPT.contains("locked: false"));
        assert!(TRY_LOCK_SCRIPT.contains("locked: true"));
    }
}
