//! Request/response model and the network backend.
//!
//! The router never talks to `reqwest` directly: everything goes through the
//! [`Network`] trait so tests can script the network and simulate outages.

use async_trait::async_trait;
use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use url::Url;

use crate::config::NetworkConfig;

/// What the request is for, as the page would report it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// A full page navigation
  Document,
  /// Anything else (scripts, styles, images, XHR, model shards)
  #[default]
  Subresource,
}

/// How the request interacts with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
  #[default]
  Default,
  /// Bypass intermediate caches and force revalidation at the origin
  Reload,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub mode: FetchMode,
}

impl Request {
  /// A plain GET subresource request.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Subresource,
      mode: FetchMode::Default,
    }
  }

  /// Parse `url` into a GET request.
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  /// Mark this request as a page navigation.
  pub fn document(mut self) -> Self {
    self.destination = Destination::Document;
    self
  }

  /// Mark this request as cache-busting.
  pub fn reload(mut self) -> Self {
    self.mode = FetchMode::Reload;
    self
  }

  pub fn is_document(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// A complete response, body included. Clones share the body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    let status_text = StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or_default()
      .to_string();

    Self {
      status,
      status_text,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Synthetic response for a resource that is neither reachable nor cached.
  pub fn offline() -> Self {
    Self::new(503, "Offline mode. Resource unavailable.")
      .with_header("Content-Type", "text/plain; charset=utf-8")
  }

  /// True for 2xx statuses.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup, first match wins.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Anything that can turn a request into a response.
///
/// An `Err` means the network was unusable (offline, DNS, TLS, timeout).
/// HTTP error statuses are regular `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network backend built on `reqwest`.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
    if let Some(secs) = config.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    if request.mode == FetchMode::Reload {
      builder = builder
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
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
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network for tests.

  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  enum Script {
    Respond(Response),
    Fail,
  }

  /// Network fake: answers from a URL table, fails for unknown URLs or when
  /// switched offline, and counts every call.
  #[derive(Default)]
  pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Script>>,
    offline: std::sync::atomic::AtomicBool,
    calls: AtomicUsize,
    seen: Mutex<Vec<(String, FetchMode)>>,
  }

  impl FakeNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(self, url: &str, response: Response) -> Self {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), Script::Respond(response));
      self
    }

    pub fn ok(self, url: &str, body: &str) -> Self {
      self.respond(url, Response::new(200, body.to_string()))
    }

    pub fn fail(self, url: &str) -> Self {
      self
        .routes
        .lock()
        .unwrap()
        .insert(url.to_string(), Script::Fail);
      self
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn modes_for(&self, url: &str) -> Vec<FetchMode> {
      self
        .seen
        .lock()
        .unwrap()
        .iter()
        .filter(|(u, _)| u == url)
        .map(|(_, m)| *m)
        .collect()
    }
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let url = request.url.to_string();
      self.seen.lock().unwrap().push((url.clone(), request.mode));

      if self.offline.load(Ordering::SeqCst) {
        return Err(eyre!("network unreachable: {}", url));
      }

      match self.routes.lock().unwrap().get(&url) {
        Some(Script::Respond(response)) => Ok(response.clone()),
        Some(Script::Fail) | None => Err(eyre!("connection refused: {}", url)),
      }
    }
  }
}
