//! Remote document database clients.
//!
//! `DocumentClient` is the small slice of a document database the
//! `firestore` adapter needs: equality queries on one field, single document
//! creation and an atomic batch of writes. Two implementations are provided:
//! - `HttpDocumentClient`: the Firestore REST v1 API over `reqwest`.
//! - `InMemoryDocumentClient`: an in-process database with the same
//!   semantics, used by tests and offline sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::{json, Map, Value};

use crate::error_handling::types::StorageError;

/// A stored document: its backend handle and its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Backend-internal handle. Never exposed on income entries.
    pub name: String,
    pub fields: Map<String, Value>,
}

/// Equality filter on one top-level string field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

impl FieldFilter {
    pub fn eq(field: &str, value: &str) -> Self {
        Self {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    fn matches(&self, fields: &Map<String, Value>) -> bool {
        fields.get(&self.field).and_then(Value::as_str) == Some(self.value.as_str())
    }
}

/// One write of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Delete { name: String },
    /// Creates a new document with a generated handle.
    Create { fields: Map<String, Value> },
}

#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn query(
        &self,
        collection: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Document>, StorageError>;

    /// Creates one document and returns its handle.
    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StorageError>;

    /// Applies every write or none.
    async fn commit(&self, collection: &str, writes: Vec<WriteOp>) -> Result<(), StorageError>;
}

/// In-process document database.
#[derive(Default)]
pub struct InMemoryDocumentClient {
    collections: Mutex<HashMap<String, BTreeMap<String, Map<String, Value>>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

impl InMemoryDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call fail with a transport error until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of documents currently stored in `collection`.
    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    fn check_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Transport(
                "document database unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn generate_name(&self) -> String {
        format!("doc{:08}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl DocumentClient for InMemoryDocumentClient {
    async fn query(
        &self,
        collection: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Document>, StorageError> {
        self.check_online()?;
        let collections = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let docs = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| filter.map_or(true, |f| f.matches(fields)))
                    .map(|(name, fields)| Document {
                        name: name.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(docs)
    }

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StorageError> {
        self.check_online()?;
        let name = self.generate_name();
        self.collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(collection.to_string())
            .or_default()
            .insert(name.clone(), fields);
        Ok(name)
    }

    async fn commit(&self, collection: &str, writes: Vec<WriteOp>) -> Result<(), StorageError> {
        self.check_online()?;
        let mut collections = self.collections.lock().unwrap_or_else(PoisonError::into_inner);
        let docs = collections.entry(collection.to_string()).or_default();
        for write in writes {
            match write {
                WriteOp::Delete { name } => {
                    docs.remove(&name);
                }
                WriteOp::Create { fields } => {
                    docs.insert(self.generate_name(), fields);
                }
            }
        }
        Ok(())
    }
}

/// Firestore REST v1 client.
///
/// Document names are full resource paths
/// (`projects/{p}/databases/(default)/documents/{collection}/{id}`), which is
/// what the delete writes of a commit expect.
pub struct HttpDocumentClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    auth_token: Option<String>,
}

impl HttpDocumentClient {
    pub fn new(base_url: &str, project: &str, auth_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            auth_token,
        }
    }

    fn documents_root(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project)
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}{}", self.base_url, self.documents_root(), suffix)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json(
        &self,
        builder: reqwest::RequestBuilder,
        body: &Value,
    ) -> Result<Value, StorageError> {
        let response = builder.json(body).send().await.map_err(|e| {
            error!("Document database request failed: {}", e);
            StorageError::from(e)
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("Document database returned {}: {}", status, text);
            return Err(StorageError::Transport(format!(
                "document database returned {}",
                status
            )));
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl DocumentClient for HttpDocumentClient {
    async fn query(
        &self,
        collection: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Document>, StorageError> {
        let mut structured = json!({ "from": [{ "collectionId": collection }] });
        if let Some(f) = filter {
            structured["where"] = json!({
                "fieldFilter": {
                    "field": { "fieldPath": f.field },
                    "op": "EQUAL",
                    "value": { "stringValue": f.value },
                }
            });
        }
        let body = json!({ "structuredQuery": structured });
        let response = self
            .send_json(self.request(reqwest::Method::POST, self.url(":runQuery")), &body)
            .await?;

        let rows = response.as_array().ok_or_else(|| {
            StorageError::Serialization("runQuery response is not an array".to_string())
        })?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            // Rows without a document carry only read metadata.
            let Some(doc) = row.get("document") else { continue };
            let name = doc
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::Serialization("document without name".to_string()))?
                .to_string();
            let fields = match doc.get("fields") {
                Some(Value::Object(encoded)) => decode_fields(encoded)?,
                _ => Map::new(),
            };
            docs.push(Document { name, fields });
        }
        debug!("runQuery on '{}' returned {} document(s)", collection, docs.len());
        Ok(docs)
    }

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, StorageError> {
        let body = json!({ "fields": encode_fields(&fields) });
        let response = self
            .send_json(
                self.request(reqwest::Method::POST, self.url(&format!("/{}", collection))),
                &body,
            )
            .await?;
        response
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StorageError::Serialization("created document has no name".to_string()))
    }

    async fn commit(&self, collection: &str, writes: Vec<WriteOp>) -> Result<(), StorageError> {
        if writes.is_empty() {
            return Ok(());
        }
        let root = self.documents_root();
        let encoded: Vec<Value> = writes
            .into_iter()
            .map(|write| match write {
                WriteOp::Delete { name } => json!({ "delete": name }),
                WriteOp::Create { fields } => json!({
                    "update": {
                        "name": format!("{}/{}/{}", root, collection, uuid::Uuid::new_v4().simple()),
                        "fields": encode_fields(&fields),
                    },
                    "currentDocument": { "exists": false },
                }),
            })
            .collect();
        let count = encoded.len();
        self.send_json(
            self.request(reqwest::Method::POST, self.url(":commit")),
            &json!({ "writes": encoded }),
        )
        .await?;
        debug!("Committed {} write(s) to '{}'", count, collection);
        Ok(())
    }
}

/// Encodes plain JSON fields as Firestore typed values.
pub fn encode_fields(fields: &Map<String, Value>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// Decodes Firestore typed values back into plain JSON fields.
pub fn decode_fields(encoded: &Map<String, Value>) -> Result<Map<String, Value>, StorageError> {
    encoded
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_value(v)?)))
        .collect()
}

fn decode_value(value: &Value) -> Result<Value, StorageError> {
    let Some((kind, inner)) = value.as_object().and_then(|o| o.iter().next()) else {
        return Err(StorageError::Serialization(format!(
            "untyped document value {}",
            value
        )));
    };
    let decoded = match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" | "doubleValue" | "stringValue" | "timestampValue" => inner.clone(),
        "integerValue" => {
            let raw = inner.as_str().map(str::to_string).unwrap_or_else(|| inner.to_string());
            let parsed: i64 = raw.parse().map_err(|_| {
                StorageError::Serialization(format!("bad integerValue '{}'", raw))
            })?;
            Value::from(parsed)
        }
        "arrayValue" => Value::Array(
            inner
                .get("values")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default(),
        ),
        "mapValue" => match inner.get("fields") {
            Some(Value::Object(fields)) => Value::Object(decode_fields(fields)?),
            _ => Value::Object(Map::new()),
        },
        other => {
            warn!("Unsupported document value type '{}', keeping raw value", other);
            inner.clone()
        }
    };
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fields(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_query_filter_and_commit() {
        let client = InMemoryDocumentClient::new();
        client.create("income-data", fields(json!({"id": "a", "userId": "u1"}))).await.unwrap();
        let b = client.create("income-data", fields(json!({"id": "b", "userId": "u2"}))).await.unwrap();

        let u1 = client.query("income-data", Some(&FieldFilter::eq("userId", "u1"))).await.unwrap();
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].fields["id"], "a");

        client
            .commit(
                "income-data",
                vec![
                    WriteOp::Delete { name: b },
                    WriteOp::Create { fields: fields(json!({"id": "c", "userId": "u2"})) },
                ],
            )
            .await
            .unwrap();
        let u2 = client.query("income-data", Some(&FieldFilter::eq("userId", "u2"))).await.unwrap();
        assert_eq!(u2.len(), 1);
        assert_eq!(u2[0].fields["id"], "c");
        assert_eq!(client.document_count("income-data"), 2);
    }

    #[tokio::test]
    async fn test_in_memory_offline_fails_with_transport() {
        let client = InMemoryDocumentClient::new();
        client.set_offline(true);
        assert!(matches!(
            client.query("income-data", None).await,
            Err(StorageError::Transport(_))
        ));
    }

    #[test]
    fn test_value_encoding_roundtrip_keeps_number_kinds() {
        let original = fields(json!({
            "id": "x", "amount": 500.5, "timestamp": 1700000000000i64,
            "flag": true, "none": null, "tags": ["a"], "nested": {"k": 1}
        }));
        let encoded = encode_fields(&original);
        assert_eq!(encoded["amount"], json!({"doubleValue": 500.5}));
        assert_eq!(encoded["timestamp"], json!({"integerValue": "1700000000000"}));
        let decoded = decode_fields(encoded.as_object().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn test_http_query_decodes_documents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/demo/databases/(default)/documents:runQuery"))
            .and(header("authorization", "Bearer tok"))
            .and(body_partial_json(json!({
                "structuredQuery": {"where": {"fieldFilter": {"value": {"stringValue": "u1"}}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"document": {
                    "name": "projects/demo/databases/(default)/documents/income-data/d1",
                    "fields": {"id": {"stringValue": "e1"}, "amount": {"integerValue": "500"}}
                }},
                {"readTime": "2024-01-01T00:00:00Z"}
            ])))
            .mount(&server)
            .await;

        let client = HttpDocumentClient::new(&server.uri(), "demo", Some("tok".into()));
        let docs = client
            .query("income-data", Some(&FieldFilter::eq("userId", "u1")))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].name.ends_with("/income-data/d1"));
        assert_eq!(docs[0].fields["amount"], json!(500));
    }

    #[tokio::test]
    async fn test_http_error_status_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let client = HttpDocumentClient::new(&server.uri(), "demo", None);
        assert!(matches!(
            client.query("income-data", None).await,
            Err(StorageError::Transport(_))
        ));
    }
}
