//! Search index client.
//!
//! The [`Retriever`] trait is the seam the runner depends on; the
//! [`SearchIndexClient`] implements it against an Azure AI Search style REST
//! endpoint (`POST /indexes/{index}/docs/search`).

use crate::config::{Credential, SearchConfig};
use crate::error::{EvalError, RetrievalError, Result};
use crate::query::Query;
use async_trait::async_trait;
use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// One hit returned by the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// 1-based position in the result list.
    pub rank: usize,
    /// Raw passage text, before sanitization.
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filepath: Option<String>,
}

impl RetrievedDocument {
    pub fn new(rank: usize, content: impl Into<String>) -> Self {
        Self {
            rank,
            content: content.into(),
            source_id: None,
            search_score: None,
            title: None,
            url: None,
            filepath: None,
        }
    }

    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }
}

/// Anything that can answer a query with ranked documents.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return at most `top_k` documents in the backend's relevance order.
    async fn retrieve(
        &self,
        query: &Query,
        top_k: usize,
    ) -> std::result::Result<Vec<RetrievedDocument>, RetrievalError>;
}

/// How [`SearchIndexClient::lookup`] found a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMatch {
    /// Exact match on the `chunk_id` or `id` key field.
    Key(&'static str),
    /// Best search hit for the file name decoded from the id. May be another
    /// chunk of the same document.
    FileName,
}

impl LookupMatch {
    pub fn is_approximate(self) -> bool {
        matches!(self, LookupMatch::FileName)
    }
}

/// A chunk fetched by key, with the field names the index returned.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub document: RetrievedDocument,
    pub fields: Vec<String>,
    pub matched_by: LookupMatch,
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    search: &'a str,
    top: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

/// Service error body.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

const ID_FIELDS: &[&str] = &["id", "chunk_id"];
const PATH_FIELDS: &[&str] = &["filepath", "filename", "metadata_storage_name"];

/// REST client for the search index.
#[derive(Clone)]
pub struct SearchIndexClient {
    client: Client,
    config: SearchConfig,
    credential: Credential,
}

impl SearchIndexClient {
    /// Create a client from resolved settings.
    pub fn new(config: SearchConfig) -> Result<Self> {
        let credential = config.credential()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EvalError::config(format!("Failed to build search client: {}", e)))?;

        Ok(Self {
            client,
            config,
            credential,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.config.index
    }

    /// Get the search endpoint URL.
    fn search_url(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        format!(
            "{}/indexes/{}/docs/search?api-version={}",
            base, self.config.index, self.config.api_version
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::ApiKey(key) => request.header("api-key", key),
            Credential::BearerToken(token) => request.bearer_auth(token),
        }
    }

    async fn post_search(
        &self,
        body: &SearchRequest<'_>,
    ) -> std::result::Result<Vec<Map<String, Value>>, RetrievalError> {
        let response = self
            .authorize(self.client.post(self.search_url()))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(self.status_error(status, &text));
        }

        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| RetrievalError::MalformedResponse(e.to_string()))?;
        Ok(parsed.value)
    }

    fn status_error(&self, status: StatusCode, body: &str) -> RetrievalError {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RetrievalError::Unauthorized {
                status: status.as_u16(),
                message,
            },
            StatusCode::NOT_FOUND => RetrievalError::IndexNotFound(self.config.index.clone()),
            _ => RetrievalError::Backend {
                status: status.as_u16(),
                message,
            },
        }
    }

    fn document_from_hit(&self, rank: usize, hit: &Map<String, Value>) -> RetrievedDocument {
        let content = self
            .config
            .content_fields
            .iter()
            .find_map(|field| non_empty_text(hit.get(field)))
            .unwrap_or_else(|| Value::Object(hit.clone()).to_string());

        RetrievedDocument {
            rank,
            content,
            source_id: first_text(hit, ID_FIELDS),
            search_score: hit.get("@search.score").and_then(Value::as_f64),
            title: first_text(hit, &["title"]),
            url: first_text(hit, &["url"]),
            filepath: first_text(hit, PATH_FIELDS),
        }
    }

    /// Fetch a single chunk by key, trying `chunk_id` and then `id`.
    ///
    /// When neither key matches and the id embeds a source URL, the top hit
    /// for the URL's file name is returned, marked as approximate.
    pub async fn lookup(
        &self,
        id: &str,
    ) -> std::result::Result<Option<IndexedChunk>, RetrievalError> {
        let escaped = id.replace('\'', "''");

        for key_field in ["chunk_id", "id"] {
            let request = SearchRequest {
                search: "*",
                top: 1,
                filter: Some(format!("{} eq '{}'", key_field, escaped)),
            };

            // An index without this field answers 400; try the next one.
            let hits = match self.post_search(&request).await {
                Ok(hits) => hits,
                Err(RetrievalError::Backend { status: 400, .. }) => continue,
                Err(e) => return Err(e),
            };

            if let Some(hit) = hits.first() {
                debug!(id, key_field, "chunk found");
                return Ok(Some(IndexedChunk {
                    document: self.document_from_hit(1, hit),
                    fields: hit.keys().cloned().collect(),
                    matched_by: LookupMatch::Key(key_field),
                }));
            }
        }

        let Some(url) = decode_source_url(id) else {
            return Ok(None);
        };
        let Some(file_name) = source_file_name(&url) else {
            return Ok(None);
        };

        debug!(id, file_name, "no key match, searching by file name");
        let request = SearchRequest {
            search: file_name,
            top: 1,
            filter: None,
        };
        let hits = self.post_search(&request).await?;

        Ok(hits.first().map(|hit| IndexedChunk {
            document: self.document_from_hit(1, hit),
            fields: hit.keys().cloned().collect(),
            matched_by: LookupMatch::FileName,
        }))
    }
}

#[async_trait]
impl Retriever for SearchIndexClient {
    async fn retrieve(
        &self,
        query: &Query,
        top_k: usize,
    ) -> std::result::Result<Vec<RetrievedDocument>, RetrievalError> {
        if query.text.trim().is_empty() {
            return Err(RetrievalError::InvalidRequest(
                "query text is empty".to_string(),
            ));
        }
        if top_k == 0 {
            return Err(RetrievalError::InvalidRequest(
                "top_k must be at least 1".to_string(),
            ));
        }

        let request = SearchRequest {
            search: &query.text,
            top: top_k,
            filter: None,
        };

        let hits = self.post_search(&request).await?;
        debug!(query = %query.text, hits = hits.len(), "search completed");

        Ok(hits
            .iter()
            .take(top_k)
            .enumerate()
            .map(|(i, hit)| self.document_from_hit(i + 1, hit))
            .collect())
    }
}

fn non_empty_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => (!s.is_empty()).then(|| s.clone()),
        other => Some(other.to_string()),
    }
}

fn first_text(hit: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .find_map(|field| hit.get(*field).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Url-safe base64 as indexers write it: padding optional, stray trailing bits ignored.
const CHUNK_ID_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Recover the origin URL embedded in an indexer-generated chunk id.
///
/// Ids look like `<hash>_<base64url>_pages_<n>`; the long segment is the
/// url-safe base64 of the source document's URL.
pub fn decode_source_url(id: &str) -> Option<String> {
    id.split('_').filter(|part| part.len() > 20).find_map(|part| {
        let bytes = CHUNK_ID_ENGINE.decode(part.as_bytes()).ok()?;
        let decoded = String::from_utf8(bytes).ok()?;
        let decoded = decoded.trim_end();
        decoded.contains("http").then(|| decoded.to_string())
    })
}

/// File name at the end of a decoded source URL, without the `;N` chunk suffix.
pub fn source_file_name(url: &str) -> Option<&str> {
    let last = url.rsplit('/').next()?;
    let name = last.split(';').next().unwrap_or(last).trim();
    (!name.is_empty()).then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> SearchConfig {
        SearchConfig {
            endpoint: format!("{}/", server.uri()),
            index: "docs".to_string(),
            api_key: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_search_url_construction() {
        let config = SearchConfig {
            endpoint: "https://search.example.net/".to_string(),
            index: "handbook".to_string(),
            api_key: Some("k".to_string()),
            ..Default::default()
        };
        let client = SearchIndexClient::new(config).unwrap();
        assert_eq!(
            client.search_url(),
            "https://search.example.net/indexes/handbook/docs/search?api-version=2023-11-01"
        );
    }

    #[test]
    fn test_new_without_credential_fails() {
        let config = SearchConfig {
            endpoint: "https://search.example.net".to_string(),
            index: "handbook".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SearchIndexClient::new(config),
            Err(EvalError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_maps_hits_in_rank_order() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/indexes/docs/docs/search"))
            .and(query_param("api-version", "2023-11-01"))
            .and(header("api-key", "secret"))
            .and(body_partial_json(serde_json::json!({"search": "what is x?", "top": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    {"@search.score": 2.5, "chunk_id": "c1", "content": "first", "title": "Intro", "filepath": "intro.md"},
                    {"@search.score": 1.5, "id": "c2", "text": "second"},
                    {"@search.score": 0.5, "id": "c3", "content": "third"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        let docs = client
            .retrieve(&Query::new(0, "what is x?"), 2)
            .await
            .unwrap();

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].rank, 1);
        assert_eq!(docs[0].content, "first");
        assert_eq!(docs[0].source_id.as_deref(), Some("c1"));
        assert_eq!(docs[0].search_score, Some(2.5));
        assert_eq!(docs[0].title.as_deref(), Some("Intro"));
        assert_eq!(docs[0].filepath.as_deref(), Some("intro.md"));
        assert_eq!(docs[1].rank, 2);
        assert_eq!(docs[1].content, "second");
    }

    #[tokio::test]
    async fn test_hit_without_content_field_is_serialized() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "x", "body": "elsewhere"}]
            })))
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        let docs = client.retrieve(&Query::new(0, "q"), 3).await.unwrap();

        assert!(docs[0].content.contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"search": "unauthorized"})))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": {"code": "Forbidden", "message": "bad key"}
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"search": "missing"})))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such index"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"search": "broken"})))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();

        let err = client
            .retrieve(&Query::new(0, "unauthorized"), 3)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RetrievalError::Unauthorized {
                status: 403,
                message: "bad key".to_string()
            }
        );

        let err = client.retrieve(&Query::new(1, "missing"), 3).await.unwrap_err();
        assert_eq!(err, RetrievalError::IndexNotFound("docs".to_string()));

        let err = client.retrieve(&Query::new(2, "broken"), 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Backend { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        let err = client.retrieve(&Query::new(0, "q"), 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend() {
        let config = SearchConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            index: "docs".to_string(),
            api_key: Some("k".to_string()),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let client = SearchIndexClient::new(config).unwrap();
        let err = client.retrieve(&Query::new(0, "q"), 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        assert!(matches!(
            client.retrieve(&Query::new(0, "   "), 3).await,
            Err(RetrievalError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.retrieve(&Query::new(0, "q"), 0).await,
            Err(RetrievalError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_bearer_token_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .expect(1)
            .mount(&server)
            .await;

        let config = SearchConfig {
            api_key: None,
            bearer_token: Some("tok".to_string()),
            ..config_for(&server)
        };
        let client = SearchIndexClient::new(config).unwrap();
        let docs = client.retrieve(&Query::new(0, "q"), 3).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_id_field() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"filter": "chunk_id eq 'it''s'"})))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Invalid expression: Could not find a property named 'chunk_id'"}
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"filter": "id eq 'it''s'"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "it's", "title": "Found", "content": "body"}]
            })))
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        let chunk = client.lookup("it's").await.unwrap().unwrap();

        assert_eq!(chunk.document.title.as_deref(), Some("Found"));
        assert_eq!(chunk.document.content, "body");
        assert!(chunk.fields.contains(&"title".to_string()));
        assert_eq!(chunk.matched_by, LookupMatch::Key("id"));
        assert!(!chunk.matched_by.is_approximate());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_file_name_search() {
        let server = MockServer::start().await;
        let url = "https://store.blob.core.windows.net/docs/admin/rbs-planning.md;105";
        let id = format!("42a2af166b30_{}_pages_0", URL_SAFE.encode(url));

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"search": "*"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .expect(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"search": "rbs-planning.md", "top": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"chunk_id": "other_chunk", "title": "RBS planning", "content": "Plan storage"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        let chunk = client.lookup(&id).await.unwrap().unwrap();

        assert_eq!(chunk.matched_by, LookupMatch::FileName);
        assert!(chunk.matched_by.is_approximate());
        assert_eq!(chunk.document.title.as_deref(), Some("RBS planning"));
        assert_eq!(chunk.document.source_id.as_deref(), Some("other_chunk"));
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .mount(&server)
            .await;

        let client = SearchIndexClient::new(config_for(&server)).unwrap();
        assert!(client.lookup("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_decode_source_url() {
        let url = "https://store.blob.core.windows.net/docs/admin/rbs-planning.md;105";
        let encoded = URL_SAFE.encode(url).trim_end_matches('=').to_string();
        let id = format!("42a2af166b30_{}_pages_0", encoded);

        assert_eq!(decode_source_url(&id).as_deref(), Some(url));
    }

    #[test]
    fn test_decode_source_url_with_trailing_bits() {
        let id = "f5e06cdd18ba_aHR0cHM6Ly9zdHpwejV4dmcyZWxzdmUuYmxvYi5jb3JlLndpbmRvd3MubmV0L2RvY3MvT2ZmaWNlRG9jcy1TaGFyZVBvaW50LXByL1NoYXJlUG9pbnQvU2hhcmVQb2ludFNlcnZlci9zZWFyY2gvY2hhbmdpbmctdGhlLXJhbmtpbmctb2Ytc2VhcmNoLXJlc3VsdHMubWQ7NA2_pages_0";

        let url = decode_source_url(id).unwrap();

        assert_eq!(
            url,
            "https://stzpz5xvg2elsve.blob.core.windows.net/docs/OfficeDocs-SharePoint-pr/SharePoint/SharePointServer/search/changing-the-ranking-of-search-results.md;4"
        );
        assert_eq!(
            source_file_name(&url),
            Some("changing-the-ranking-of-search-results.md")
        );
    }

    #[test]
    fn test_decode_padded_source_url() {
        let id = "42a2af166b30_aHR0cHM6Ly9zdHpwejV4dmcyZWxzdmUuYmxvYi5jb3JlLndpbmRvd3MubmV0L2RvY3MvT2ZmaWNlRG9jcy1TaGFyZVBvaW50LXByL1NoYXJlUG9pbnQvU2hhcmVQb2ludFNlcnZlci9hZG1pbmlzdHJhdGlvbi9yYnMtcGxhbm5pbmcubWQ7MTA1_pages_0";
        let url = decode_source_url(id).unwrap();
        assert!(url.ends_with("/administration/rbs-planning.md;105"));
        assert_eq!(source_file_name(&url), Some("rbs-planning.md"));
    }

    #[test]
    fn test_decode_source_url_without_embedded_url() {
        assert_eq!(decode_source_url("plain-id"), None);
        assert_eq!(decode_source_url("abc_not-base64-but-long-enough!!_pages_1"), None);
    }
}
