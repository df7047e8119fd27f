/*!
Appwrite row store adapter.

Talks to the TablesDB REST API of an Appwrite server using an API key.
Requests that fail transiently (connection problems, timeouts, 429 and 5xx
responses) are retried with exponential backoff; every other failure is
reported immediately.
*/

use super::RowStore;
use crate::config::StoreConfig;
use crate::record::{Row, ID_FIELD};
use crate::{BackupError, Result};
use async_trait::async_trait;
use inkvault_retry::{classify, row_store_backoff_policy, with_custom_backoff, RetryableError};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Failure of a single HTTP exchange with Appwrite
#[derive(Debug, Error)]
enum AppwriteError {
    #[error("request failed: {message}")]
    Transport { message: String, transient: bool },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
}

impl RetryableError for AppwriteError {
    fn is_transient(&self) -> bool {
        match self {
            AppwriteError::Transport { transient, .. } => *transient,
            AppwriteError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

impl From<reqwest::Error> for AppwriteError {
    fn from(err: reqwest::Error) -> Self {
        AppwriteError::Transport {
            transient: err.is_timeout() || err.is_connect() || err.is_request(),
            message: err.to_string(),
        }
    }
}

/// Row store backed by an Appwrite database
///
/// # Example
/// ```rust,no_run
/// use inkvault_core::{config::StoreConfig, AppwriteRowStore};
///
/// let mut config = StoreConfig::default();
/// config.project_id = Some("blog".to_string());
/// config.api_key = Some("standard_...".to_string());
/// config.database_id = Some("main".to_string());
/// let store = AppwriteRowStore::new(&config)?;
/// # Ok::<(), inkvault_core::BackupError>(())
/// ```
#[derive(Debug, Clone)]
pub struct AppwriteRowStore {
    client: Client,
    endpoint: String,
    project_id: String,
    api_key: String,
    database_id: String,
    page_size: usize,
}

impl AppwriteRowStore {
    /// Create a client from the store configuration
    ///
    /// # Errors
    /// Returns a configuration error when the project, key or database
    /// identifier is missing, or if the HTTP client cannot be built.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let (project_id, api_key, database_id) = config.require_credentials()?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("inkvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::store(format!("Failed to build HTTP client: {e}")))?;

        info!(
            endpoint = %config.endpoint,
            database = %database_id,
            "Initialized Appwrite row store"
        );

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            api_key: api_key.to_string(),
            database_id: database_id.to_string(),
            page_size: config.page_size.max(1),
        })
    }

    fn tables_url(&self) -> String {
        format!("{}/tablesdb/{}/tables", self.endpoint, self.database_id)
    }

    fn rows_url(&self, table_id: &str) -> String {
        format!("{}/{}/rows", self.tables_url(), table_id)
    }

    fn row_url(&self, table_id: &str, row_id: &str) -> String {
        format!("{}/{}", self.rows_url(table_id), row_id)
    }

    /// Send one request with retries and decode the JSON response
    async fn execute(
        &self,
        operation: &'static str,
        method: Method,
        url: String,
        queries: Vec<String>,
        body: Option<Value>,
    ) -> Result<Value> {
        let client = self.client.clone();
        let project_id = self.project_id.clone();
        let api_key = self.api_key.clone();

        with_custom_backoff(operation, row_store_backoff_policy(), move |attempt| {
            let mut request = client
                .request(method.clone(), &url)
                .header("X-Appwrite-Project", &project_id)
                .header("X-Appwrite-Key", &api_key);
            for query in &queries {
                request = request.query(&[("queries[]", query)]);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }
            debug!(operation, attempt, url = %url, "Sending Appwrite request");

            Box::pin(async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| classify(operation, AppwriteError::from(e)))?;
                let status = response.status();

                if status == StatusCode::NO_CONTENT {
                    return Ok(Value::Null);
                }
                if status.is_success() {
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|e| classify(operation, AppwriteError::from(e)));
                }

                let text = response.text().await.unwrap_or_default();
                Err(classify(
                    operation,
                    AppwriteError::Status {
                        status: status.as_u16(),
                        message: error_message(&text),
                    },
                ))
            })
        })
        .await
        .map_err(|e| BackupError::store(format!("{operation}: {}", e.into_source())))
    }

    /// Page through a list endpoint using cursor pagination
    async fn list_all(
        &self,
        operation: &'static str,
        url: String,
        items_key: &str,
    ) -> Result<Vec<Row>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut queries = vec![json!({"method": "limit", "values": [self.page_size]}).to_string()];
            if let Some(cursor) = &cursor {
                queries.push(json!({"method": "cursorAfter", "values": [cursor]}).to_string());
            }

            let page = self
                .execute(operation, Method::GET, url.clone(), queries, None)
                .await?;
            let batch = match page.get(items_key) {
                Some(Value::Array(batch)) => batch.clone(),
                _ => {
                    return Err(BackupError::store(format!(
                        "{operation}: response has no '{items_key}' array"
                    )))
                }
            };

            let batch_len = batch.len();
            for item in batch {
                items.push(into_row(operation, item)?);
            }

            cursor = items
                .last()
                .and_then(|row| row.get(ID_FIELD))
                .and_then(Value::as_str)
                .map(str::to_string);
            if batch_len < self.page_size || cursor.is_none() {
                break;
            }
        }

        Ok(items)
    }
}

fn into_row(operation: &str, value: Value) -> Result<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => Err(BackupError::store(format!(
            "{operation}: expected an object, got {other}"
        ))),
    }
}

/// Extract Appwrite's `message` field from an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl RowStore for AppwriteRowStore {
    async fn list_rows(&self, collection_id: &str) -> Result<Vec<Row>> {
        let rows = self
            .list_all("list_rows", self.rows_url(collection_id), "rows")
            .await?;
        debug!(collection = collection_id, rows = rows.len(), "Listed rows");
        Ok(rows)
    }

    async fn check_collection(&self, collection_id: &str) -> Result<()> {
        let query = json!({"method": "limit", "values": [1]}).to_string();
        let page = self
            .execute(
                "check_collection",
                Method::GET,
                self.rows_url(collection_id),
                vec![query],
                None,
            )
            .await?;
        match page.get("rows") {
            Some(Value::Array(_)) => Ok(()),
            _ => Err(BackupError::store(
                "check_collection: response has no 'rows' array",
            )),
        }
    }

    async fn get_row(&self, collection_id: &str, row_id: &str) -> Result<Row> {
        let value = self
            .execute(
                "get_row",
                Method::GET,
                self.row_url(collection_id, row_id),
                Vec::new(),
                None,
            )
            .await?;
        into_row("get_row", value)
    }

    async fn create_row(&self, collection_id: &str, data: Row) -> Result<Row> {
        let body = json!({ "rowId": "unique()", "data": data });
        let value = self
            .execute(
                "create_row",
                Method::POST,
                self.rows_url(collection_id),
                Vec::new(),
                Some(body),
            )
            .await?;
        into_row("create_row", value)
    }

    async fn update_row(&self, collection_id: &str, row_id: &str, data: Row) -> Result<Row> {
        let body = json!({ "data": data });
        let value = self
            .execute(
                "update_row",
                Method::PATCH,
                self.row_url(collection_id, row_id),
                Vec::new(),
                Some(body),
            )
            .await?;
        into_row("update_row", value)
    }

    async fn delete_row(&self, collection_id: &str, row_id: &str) -> Result<()> {
        self.execute(
            "delete_row",
            Method::DELETE,
            self.row_url(collection_id, row_id),
            Vec::new(),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let tables = self
            .list_all("list_collections", self.tables_url(), "tables")
            .await?;
        Ok(tables
            .iter()
            .filter_map(|table| table.get(ID_FIELD).and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> StoreConfig {
        StoreConfig {
            endpoint: "https://appwrite.example.com/v1/".to_string(),
            project_id: Some("blog".to_string()),
            api_key: Some("secret".to_string()),
            database_id: Some("main".to_string()),
            page_size: 50,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_urls() {
        let store = AppwriteRowStore::new(&test_config()).unwrap();
        assert_eq!(
            store.tables_url(),
            "https://appwrite.example.com/v1/tablesdb/main/tables"
        );
        assert_eq!(
            store.rows_url("posts"),
            "https://appwrite.example.com/v1/tablesdb/main/tables/posts/rows"
        );
        assert_eq!(
            store.row_url("posts", "abc"),
            "https://appwrite.example.com/v1/tablesdb/main/tables/posts/rows/abc"
        );
    }

    #[test]
    fn test_missing_credentials() {
        let mut config = test_config();
        config.api_key = None;
        let err = AppwriteRowStore::new(&config).unwrap_err();
        assert!(err.to_string().contains("APPWRITE_API_KEY"));
    }

    #[test]
    fn test_status_classification() {
        let transient = AppwriteError::Status {
            status: 503,
            message: "unavailable".to_string(),
        };
        let throttled = AppwriteError::Status {
            status: 429,
            message: "rate limit".to_string(),
        };
        let missing = AppwriteError::Status {
            status: 404,
            message: "Table with the requested ID could not be found.".to_string(),
        };
        assert!(transient.is_transient());
        assert!(throttled.is_transient());
        assert!(missing.is_permanent());
    }

    /// Local HTTP server answering one scripted response per connection
    struct StubServer {
        endpoint: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl StubServer {
        async fn start(responses: Vec<(u16, Value)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let endpoint = format!("http://{}/v1", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            tokio::spawn(async move {
                for (status, body) in responses {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        head.extend_from_slice(&chunk[..n]);
                    }
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&head).into_owned());

                    let body = body.to_string();
                    let response = format!(
                        "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\n\
                         content-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    socket.shutdown().await.unwrap();
                }
            });

            Self { endpoint, requests }
        }

        fn request_lines(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|head| head.lines().next().unwrap_or_default().to_string())
                .collect()
        }

        fn store(&self, page_size: usize) -> AppwriteRowStore {
            let mut config = test_config();
            config.endpoint = self.endpoint.clone();
            config.page_size = page_size;
            let mut store = AppwriteRowStore::new(&config).unwrap();
            store.client = Client::builder().no_proxy().build().unwrap();
            store
        }
    }

    fn page(ids: &[&str]) -> Value {
        let rows: Vec<Value> = ids.iter().map(|id| json!({"$id": id, "title": id})).collect();
        json!({"total": 3, "rows": rows})
    }

    #[tokio::test]
    async fn test_list_rows_follows_cursor_until_short_page() {
        let server = StubServer::start(vec![(200, page(&["r0", "r1"])), (200, page(&["r2"]))]).await;
        let store = server.store(2);

        let rows = store.list_rows("posts").await.unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|row| row[ID_FIELD].as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2"]);

        let lines = server.request_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("GET /v1/tablesdb/main/tables/posts/rows?"));
        assert!(lines[0].contains("%22limit%22%2C%22values%22%3A%5B2%5D"));
        assert!(!lines[0].contains("cursorAfter"));
        assert!(lines[1].contains("cursorAfter"));
        assert!(lines[1].contains("%22r1%22"));

        let heads = server.requests.lock().unwrap();
        assert!(heads[0].to_lowercase().contains("x-appwrite-project: blog"));
        assert!(heads[0].to_lowercase().contains("x-appwrite-key: secret"));
    }

    #[tokio::test]
    async fn test_empty_table_needs_one_request() {
        let server = StubServer::start(vec![(200, json!({"total": 0, "rows": []}))]).await;
        let rows = server.store(2).list_rows("drafts").await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(server.request_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_response_is_retried() {
        let server = StubServer::start(vec![
            (503, json!({"message": "Service unavailable"})),
            (200, page(&["r0"])),
        ])
        .await;

        let rows = server.store(50).list_rows("posts").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(server.request_lines().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let server = StubServer::start(vec![(
            404,
            json!({"message": "Table with the requested ID could not be found.", "code": 404}),
        )])
        .await;

        let err = server.store(50).list_rows("ghost").await.unwrap_err();
        assert!(err.to_string().contains("could not be found"));
        assert_eq!(server.request_lines().len(), 1);
    }

    #[tokio::test]
    async fn test_check_collection_reads_a_single_row() {
        let server = StubServer::start(vec![(200, json!({"total": 120, "rows": [{"$id": "r0"}]}))]).await;

        server.store(50).check_collection("posts").await.unwrap();
        let lines = server.request_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("%22limit%22%2C%22values%22%3A%5B1%5D"));
        assert!(!lines[0].contains("cursorAfter"));
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"message":"The current user is not authorized","code":401,"type":"user_unauthorized"}"#;
        assert_eq!(error_message(body), "The current user is not authorized");
        assert_eq!(error_message("Bad Gateway\n"), "Bad Gateway");
    }
}
