use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::error::{ApiError, Operation, RequestContext};
use super::types::{DeleteAck, Resource};

/// Error body shape the backend uses for failed requests.
#[derive(Debug, Deserialize)]
struct ErrorBody {
  message: Option<String>,
}

/// Stateless REST adapter for the catalog backend.
///
/// Every request carries a JSON content type and the session cookies
/// collected so far.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(base_url: &str) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL '{}': {}", base_url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("API base URL '{}' cannot carry paths", base_url));
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let http = reqwest::Client::builder()
      .default_headers(headers)
      .cookie_store(true)
      .user_agent(concat!("hpadmin/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Build an endpoint URL below the base, percent-encoding each segment.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
    self.http.request(method, self.endpoint(segments))
  }

  /// `GET /{collection}`
  pub async fn list<R: Resource>(&self) -> Result<Vec<R>, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::List);
    let request = self.request(Method::GET, &[R::COLLECTION]);
    let records: Vec<R> = self.send_json(request, &context).await?;
    debug!(collection = R::COLLECTION, count = records.len(), "Listed records");
    Ok(records)
  }

  /// `POST /{collection}/create`
  pub async fn create<R: Resource>(&self, input: &R::Input) -> Result<R, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Create);
    let request = self
      .request(Method::POST, &[R::COLLECTION, "create"])
      .json(input);
    self.send_json(request, &context).await
  }

  /// `PUT /{collection}/update/{id}`
  pub async fn update<R: Resource>(&self, id: &str, input: &R::Input) -> Result<R, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Update).with_id(id);
    let request = self
      .request(Method::PUT, &[R::COLLECTION, "update", id])
      .json(input);
    self.send_json(request, &context).await
  }

  /// `DELETE /{collection}/delete/{id}`
  ///
  /// The acknowledgment body is optional; an empty or non-JSON body is
  /// still a success.
  pub async fn delete<R: Resource>(&self, id: &str) -> Result<DeleteAck, ApiError> {
    let context = RequestContext::new(R::entity_type(), Operation::Delete).with_id(id);
    let request = self.request(Method::DELETE, &[R::COLLECTION, "delete", id]);
    let body = self.send(request, &context).await?;
    Ok(serde_json::from_str(&body).unwrap_or_default())
  }

  /// `POST /chat` and return the reply text.
  pub async fn chat(&self, message: &str) -> Result<String, ApiError> {
    let context = RequestContext::new("chat", Operation::Chat);
    let request = self
      .request(Method::POST, &["chat"])
      .json(&serde_json::json!({ "message": message }));
    let body = self.send(request, &context).await?;
    Ok(extract_reply(&body))
  }

  async fn send_json<T: DeserializeOwned>(
    &self,
    request: RequestBuilder,
    context: &RequestContext,
  ) -> Result<T, ApiError> {
    let body = self.send(request, context).await?;
    serde_json::from_str(&body).map_err(|e| ApiError::Decode {
      context: context.clone(),
      message: e.to_string(),
    })
  }

  /// Send a request and return the body of a 2xx response.
  async fn send(&self, request: RequestBuilder, context: &RequestContext) -> Result<String, ApiError> {
    let response = request.send().await.map_err(|e| ApiError::Network {
      context: context.clone(),
      message: e.to_string(),
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| ApiError::Network {
      context: context.clone(),
      message: e.to_string(),
    })?;

    if !status.is_success() {
      let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message);
      warn!(request = %context, status = status.as_u16(), message = ?message, "Request failed");
      return Err(ApiError::Status {
        context: context.clone(),
        status: status.as_u16(),
        message,
      });
    }

    Ok(body)
  }
}

/// Pull the reply out of a chat response: a JSON string, an object with a
/// `reply`/`message`/`response` field, or the raw text.
fn extract_reply(body: &str) -> String {
  match serde_json::from_str::<serde_json::Value>(body) {
    Ok(serde_json::Value::String(reply)) => reply,
    Ok(serde_json::Value::Object(map)) => ["reply", "message", "response"]
      .iter()
      .find_map(|field| map.get(*field).and_then(|v| v.as_str()))
      .map(String::from)
      .unwrap_or_else(|| body.trim().to_string()),
    _ => body.trim().to_string(),
  }
}
