//! Request/response model shared by the interception layer and the replay queue.
//!
//! Both components talk to the backend through the [`Transport`] trait.
//! `Err` means the request never got an answer (DNS, refused connection,
//! timeout), while `Ok` carries whatever the server replied with, including
//! 4xx/5xx statuses.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// HTTP request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
      Self::Options => "OPTIONS",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Methods that mutate server state and may be queued for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WriteMethod {
  Post,
  Put,
  Patch,
  Delete,
}

impl From<WriteMethod> for Method {
  fn from(method: WriteMethod) -> Self {
    match method {
      WriteMethod::Post => Method::Post,
      WriteMethod::Put => Method::Put,
      WriteMethod::Patch => Method::Patch,
      WriteMethod::Delete => Method::Delete,
    }
  }
}

impl fmt::Display for WriteMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    Method::from(*self).fmt(f)
  }
}

impl FromStr for WriteMethod {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "POST" => Ok(Self::Post),
      "PUT" => Ok(Self::Put),
      "PATCH" => Ok(Self::Patch),
      "DELETE" => Ok(Self::Delete),
      other => Err(eyre!(
        "Unsupported write method '{}' (expected POST, PUT, PATCH or DELETE)",
        other
      )),
    }
  }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }
}

/// Response as seen by callers and as stored in cache partitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn text(status: u16, body: &str) -> Self {
    let mut response = Self::new(status, body.as_bytes());
    response
      .headers
      .insert("content-type".to_string(), "text/plain".to_string());
    response
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    let mut response = Self::new(status, value.to_string().into_bytes());
    response
      .headers
      .insert("content-type".to_string(), "application/json".to_string());
    response
  }

  /// Answer for an API request that failed in transit and has no cached copy.
  pub fn offline_api() -> Self {
    Self::json(
      503,
      &serde_json::json!({ "error": "Offline - data not available" }),
    )
  }

  /// Last-resort answer when neither the network nor the offline page is available.
  pub fn offline_text() -> Self {
    Self::text(503, "Offline")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Something that can carry a request to the backend.
pub trait Transport: Send + Sync + 'static {
  /// Send a request. `Err` is a transport failure, never an HTTP status.
  fn send(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
  fn send(&self, request: Request) -> impl Future<Output = Result<Response>> + Send {
    (**self).send(request)
  }
}

/// Transport backed by reqwest
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for ReqwestTransport {
  async fn send(&self, request: Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_write_method_parse_is_case_insensitive() {
    assert_eq!("patch".parse::<WriteMethod>().unwrap(), WriteMethod::Patch);
    assert_eq!("DELETE".parse::<WriteMethod>().unwrap(), WriteMethod::Delete);
  }

  #[test]
  fn test_write_method_rejects_reads() {
    assert!("GET".parse::<WriteMethod>().is_err());
    assert!("HEAD".parse::<WriteMethod>().is_err());
  }

  #[test]
  fn test_write_method_serializes_uppercase() {
    let json = serde_json::to_string(&WriteMethod::Put).unwrap();
    assert_eq!(json, "\"PUT\"");
  }

  #[test]
  fn test_offline_api_response_is_json_503() {
    let response = Response::offline_api();
    assert_eq!(response.status, 503);
    assert!(!response.is_success());

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body.get("error").is_some());
    assert_eq!(
      response.headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(200, Vec::new()).is_success());
    assert!(Response::new(204, Vec::new()).is_success());
    assert!(!Response::new(304, Vec::new()).is_success());
    assert!(!Response::new(500, Vec::new()).is_success());
  }
}
