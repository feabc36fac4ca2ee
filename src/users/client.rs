use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::future::Future;
use url::Url;

use crate::error::FetchError;

use super::types::User;

/// Base URL used when the config does not name one.
pub const DEFAULT_API_URL: &str = "https://jsonplaceholder.typicode.com";

/// The remote source of user records.
pub trait UserBackend: Clone + Send + Sync + 'static {
  fn get_user(&self, id: &str) -> impl Future<Output = Result<User, FetchError>> + Send;

  /// Replace the user's record, returning the server's copy.
  fn put_user(&self, user: &User) -> impl Future<Output = Result<User, FetchError>> + Send;
}

/// Users REST API client
#[derive(Clone)]
pub struct UserApi {
  client: Client,
  base: Url,
}

impl UserApi {
  pub fn new(base_url: &str) -> Result<Self, FetchError> {
    let base = Url::parse(base_url)
      .map_err(|e| FetchError::new(format!("invalid API url {}: {}", base_url, e)))?;

    // Responses must come from the server; the cache layer does the caching
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
      CONTENT_TYPE,
      HeaderValue::from_static("application/json; charset=UTF-8"),
    );

    let client = Client::builder().default_headers(headers).build()?;
    Ok(Self { client, base })
  }

  fn user_url(&self, id: &str) -> Result<Url, FetchError> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| FetchError::new(format!("API url {} cannot have a path", self.base)))?
      .pop_if_empty()
      .extend(["users", id]);
    Ok(url)
  }
}

impl UserBackend for UserApi {
  async fn get_user(&self, id: &str) -> Result<User, FetchError> {
    let response = self.client.get(self.user_url(id)?).send().await?;
    if !response.status().is_success() {
      return Err(status_error(response.status()));
    }
    Ok(response.json().await?)
  }

  async fn put_user(&self, user: &User) -> Result<User, FetchError> {
    let response = self
      .client
      .put(self.user_url(&user.id)?)
      .json(user)
      .send()
      .await?;

    if response.status() != StatusCode::OK {
      return Err(status_error(response.status()));
    }
    Ok(response.json().await?)
  }
}

fn status_error(status: StatusCode) -> FetchError {
  FetchError::with_status(
    status.as_u16(),
    format!(
      "{} {}",
      status.as_u16(),
      status.canonical_reason().unwrap_or_default()
    ),
  )
}
