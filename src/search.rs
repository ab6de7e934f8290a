//! Search gateway: forwards queries to the recommendation service and keeps
//! the per-user search audit log.

use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};
use crate::models::SearchHistoryEntry;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, query: &str, user_id: &str) -> AppResult<Value>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecommendRequest<'a> {
    query: &'a str,
    user_id: &'a str,
}

/// Recommender reached over HTTP POST with a JSON body.
pub struct HttpRecommender {
    client: reqwest::Client,
    url: String,
}

impl HttpRecommender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    async fn recommend(&self, query: &str, user_id: &str) -> AppResult<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(&RecommendRequest { query, user_id })
            .send()
            .await
            .map_err(|e| AppError::UpstreamError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::UpstreamError(format!("recommender returned {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AppError::UpstreamError(format!("unreadable response: {e}")))?;

        extract_results(body)
    }
}

/// Accepts a bare array, `{results}`, or any other object; `{error}` fails.
fn extract_results(body: Value) -> AppResult<Value> {
    match body {
        Value::Object(mut map) => {
            if let Some(error) = map.remove("error") {
                let detail = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                return Err(AppError::UpstreamError(detail));
            }
            match map.remove("results") {
                Some(results) => Ok(results),
                None => Ok(Value::Object(map)),
            }
        }
        other => Ok(other),
    }
}

pub struct SearchGateway {
    catalog: Arc<Catalog>,
    recommender: Arc<dyn Recommender>,
    timeout: Duration,
}

impl SearchGateway {
    pub fn new(catalog: Arc<Catalog>, recommender: Arc<dyn Recommender>, timeout: Duration) -> Self {
        Self {
            catalog,
            recommender,
            timeout,
        }
    }

    /// Runs a search and records it. History is only written after the
    /// recommender answers successfully.
    pub async fn search(&self, user_id: &str, query: &str) -> AppResult<Value> {
        if query.trim().is_empty() {
            return Err(AppError::bad_request("Search query cannot be empty"));
        }

        let results = tokio::time::timeout(self.timeout, self.recommender.recommend(query, user_id))
            .await
            .map_err(|_| AppError::UpstreamError(format!("timed out after {:?}", self.timeout)))??;

        let entry = SearchHistoryEntry::new(user_id.to_string(), query.to_string());
        self.catalog.append_search(&entry).await?;

        tracing::info!(user_id = %user_id, "search recorded");
        Ok(results)
    }

    pub async fn history(&self, user_id: &str) -> AppResult<Vec<SearchHistoryEntry>> {
        Ok(self.catalog.search_history(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    struct Fixed(AppResult<Value>);

    #[async_trait]
    impl Recommender for Fixed {
        async fn recommend(&self, _query: &str, _user_id: &str) -> AppResult<Value> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(_) => Err(AppError::UpstreamError("down".into())),
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl Recommender for Hangs {
        async fn recommend(&self, _query: &str, _user_id: &str) -> AppResult<Value> {
            std::future::pending().await
        }
    }

    async fn gateway(recommender: Arc<dyn Recommender>) -> (SearchGateway, String) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let user = User::new("a@example.com".into(), "h".into());
        catalog.create_user(&user).await.unwrap();
        let gateway = SearchGateway::new(catalog, recommender, Duration::from_millis(200));
        (gateway, user.id)
    }

    #[tokio::test]
    async fn empty_query_is_rejected_without_history() {
        let (gateway, user) = gateway(Arc::new(Fixed(Ok(json!([]))))).await;
        assert!(matches!(gateway.search(&user, "  ").await, Err(AppError::BadRequest(_))));
        assert!(gateway.history(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_writes_one_entry() {
        let (gateway, user) = gateway(Arc::new(Fixed(Ok(json!(["notes.txt"]))))).await;
        let results = gateway.search(&user, "meeting notes").await.unwrap();
        assert_eq!(results, json!(["notes.txt"]));

        let history = gateway.history(&user).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "meeting notes");
        assert_eq!(history[0].user_id, user);
    }

    #[tokio::test]
    async fn upstream_failure_writes_nothing() {
        let (gateway, user) = gateway(Arc::new(Fixed(Err(AppError::NotFound)))).await;
        assert!(matches!(gateway.search(&user, "q").await, Err(AppError::UpstreamError(_))));
        assert!(gateway.history(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hung_upstream_times_out() {
        let (gateway, user) = gateway(Arc::new(Hangs)).await;
        assert!(matches!(gateway.search(&user, "q").await, Err(AppError::UpstreamError(_))));
        assert!(gateway.history(&user).await.unwrap().is_empty());
    }

    #[test]
    fn response_shapes() {
        assert_eq!(extract_results(json!(["a"])).unwrap(), json!(["a"]));
        assert_eq!(extract_results(json!({"results": [1]})).unwrap(), json!([1]));
        assert_eq!(
            extract_results(json!({"local_files": [], "external_images": []})).unwrap(),
            json!({"local_files": [], "external_images": []})
        );
        assert!(matches!(
            extract_results(json!({"error": "model not loaded"})),
            Err(AppError::UpstreamError(msg)) if msg == "model not loaded"
        ));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/recommend")
    }

    #[tokio::test]
    async fn http_recommender_posts_query_and_user() {
        let app = Router::new().route(
            "/recommend",
            post(|Json(body): Json<Value>| async move {
                Json(json!({ "results": [body["query"], body["userId"]] }))
            }),
        );
        let url = serve(app).await;

        let recommender = HttpRecommender::new(url, Duration::from_secs(5)).unwrap();
        let results = recommender.recommend("cats", "u1").await.unwrap();
        assert_eq!(results, json!(["cats", "u1"]));
    }

    #[tokio::test]
    async fn http_recommender_maps_failures() {
        let app = Router::new().route(
            "/recommend",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "boom" })),
                )
            }),
        );
        let url = serve(app).await;
        let recommender = HttpRecommender::new(url, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            recommender.recommend("q", "u").await,
            Err(AppError::UpstreamError(_))
        ));

        let unreachable = HttpRecommender::new("http://127.0.0.1:9/recommend", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            unreachable.recommend("q", "u").await,
            Err(AppError::UpstreamError(_))
        ));
    }

    #[tokio::test]
    async fn http_recommender_times_out() {
        let app = Router::new().route(
            "/recommend",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!([]))
            }),
        );
        let url = serve(app).await;
        let recommender = HttpRecommender::new(url, Duration::from_millis(100)).unwrap();
        assert!(matches!(
            recommender.recommend("q", "u").await,
            Err(AppError::UpstreamError(_))
        ));
    }
}
