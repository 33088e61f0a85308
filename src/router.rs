//! Offline cache router.
//!
//! Owns the two current partitions and reacts to lifecycle events:
//! - install: pre-warm the core partition (best effort, per asset)
//! - activate: drop partitions from other versions, claim clients
//! - fetch: classify and route through cache-first or network-first
//! - message: SKIP_WAITING / CLEAR_CACHE

use color_eyre::Result;
use futures::future::join_all;
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheLayer, CacheStorage};
use crate::classify::{Classifier, ResourceClass};
use crate::commands::Command;
use crate::config::{Config, InterceptConfig};
use crate::http::{Network, Request, Response};
use crate::lifecycle::{ExtendableEvent, FetchEvent, MessageEvent};

/// Outcome of the install phase, one line per asset.
#[derive(Debug, Default)]
pub struct InstallReport {
  pub cached: Vec<Url>,
  pub failed: Vec<(Url, String)>,
}

/// Outcome of the activate phase.
#[derive(Debug, Default)]
pub struct ActivateReport {
  /// Stale partitions that were removed
  pub deleted: Vec<String>,
}

pub struct Router<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  layer: CacheLayer<S, N>,
  classifier: Classifier,
  core_partition: String,
  runtime_partition: String,
  install_set: Vec<Url>,
  cdn_resources: Vec<Url>,
  shell_url: Url,
  intercept: InterceptConfig,
  skip_waiting_on_install: bool,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S: CacheStorage, N: Network> Router<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let origin = config.origin_url()?;

    Ok(Self {
      layer: CacheLayer::new(Arc::clone(&storage), Arc::clone(&network)),
      storage,
      network,
      classifier: Classifier::new(&origin, config.classification.clone()),
      core_partition: config.core_partition(),
      runtime_partition: config.runtime_partition(),
      install_set: config.install_set()?,
      cdn_resources: config.cdn_urls()?,
      shell_url: config.shell_url()?,
      intercept: config.intercept.clone(),
      skip_waiting_on_install: config.skip_waiting_on_install,
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    })
  }

  pub fn core_partition(&self) -> &str {
    &self.core_partition
  }

  pub fn runtime_partition(&self) -> &str {
    &self.runtime_partition
  }

  /// Whether this version asked to be activated without waiting.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether this version has claimed the open pages.
  pub fn controls_clients(&self) -> bool {
    self.clients_claimed.load(Ordering::SeqCst)
  }

  /// Take control of the open pages.
  pub fn claim(&self) {
    self.clients_claimed.store(true, Ordering::SeqCst);
  }

  /// Pre-warm the core partition. Never fails: each asset is attempted on its
  /// own and failures end up in the report.
  pub async fn on_install(&self) -> InstallReport {
    info!(
      partition = %self.core_partition,
      "Installing, {} shell assets and {} CDN libraries",
      self.install_set.len(),
      self.cdn_resources.len()
    );

    let mut report = InstallReport::default();

    if let Err(e) = self.storage.open(&self.core_partition) {
      warn!("Failed to open {}: {}", self.core_partition, e);
    }

    for url in &self.install_set {
      let request = Request::get(url.clone()).reload();
      self.prewarm(request, &mut report).await;
    }

    for url in &self.cdn_resources {
      self.prewarm(Request::get(url.clone()), &mut report).await;
    }

    info!(
      "Install finished: {} cached, {} failed",
      report.cached.len(),
      report.failed.len()
    );

    if self.skip_waiting_on_install {
      self.skip_waiting.store(true, Ordering::SeqCst);
    }

    report
  }

  async fn prewarm(&self, request: Request, report: &mut InstallReport) {
    let outcome = match self.network.fetch(&request).await {
      Ok(response) if response.is_ok() => self
        .storage
        .put(
          &self.core_partition,
          &CacheKey::for_request(&request),
          &response,
        )
        .map_err(|e| e.to_string()),
      Ok(response) => Err(format!("HTTP {}", response.status)),
      Err(e) => Err(e.to_string()),
    };

    match outcome {
      Ok(()) => {
        debug!("Cached {}", request.url);
        report.cached.push(request.url);
      }
      Err(reason) => {
        warn!("Failed to cache {}: {}", request.url, reason);
        report.failed.push((request.url, reason));
      }
    }
  }

  /// Delete every partition that belongs to another version, then claim
  /// clients.
  pub async fn on_activate(&self) -> Result<ActivateReport> {
    info!("Activating");

    let mut report = ActivateReport::default();

    // Exact comparison: "core-v2" must not protect "core-v2-beta"
    let deletions = self
      .storage
      .keys()?
      .into_iter()
      .filter(|name| *name != self.core_partition && *name != self.runtime_partition)
      .map(|name| {
        let storage = Arc::clone(&self.storage);
        tokio::task::spawn_blocking(move || {
          let result = storage.delete(&name);
          (name, result)
        })
      });

    for joined in join_all(deletions).await {
      match joined {
        Ok((name, Ok(_))) => {
          info!("Deleted stale partition {}", name);
          report.deleted.push(name);
        }
        Ok((name, Err(e))) => warn!("Failed to delete stale partition {}: {}", name, e),
        Err(e) => warn!("Stale partition deletion task failed: {}", e),
      }
    }

    self.claim();
    info!("Activated, {} stale partitions removed", report.deleted.len());

    Ok(report)
  }

  /// Intercept a request. `None` means "not ours": the host should let the
  /// request go to the network untouched.
  pub async fn on_fetch(&self, event: &FetchEvent) -> Option<Response> {
    if self.is_excluded(&event.request) {
      return None;
    }

    Some(self.handle(&event.request, &event.extend).await)
  }

  fn is_excluded(&self, request: &Request) -> bool {
    if request.method != Method::GET {
      return true;
    }

    let url = &request.url;
    if self
      .intercept
      .excluded_schemes
      .iter()
      .any(|scheme| url.scheme().eq_ignore_ascii_case(scheme))
    {
      return true;
    }

    url.host_str().is_some_and(|host| {
      self
        .intercept
        .excluded_hosts
        .iter()
        .any(|needle| host.contains(needle.as_str()))
    })
  }

  /// Route a request and always produce a response.
  pub async fn handle(&self, request: &Request, event: &ExtendableEvent) -> Response {
    match self.route(request, event).await {
      Ok(response) => response,
      Err(e) => {
        error!("Failed to handle {}: {}", request.url, e);

        if request.is_document() {
          if let Some(shell) = self.shell() {
            debug!("Serving app shell for {}", request.url);
            return shell;
          }
        }

        Response::offline()
      }
    }
  }

  async fn route(&self, request: &Request, event: &ExtendableEvent) -> Result<Response> {
    let class = self.classifier.classify(&request.url);
    debug!(%class, "Routing {}", request.url);

    match class {
      ResourceClass::AppStatic | ResourceClass::CdnLibrary => {
        self
          .layer
          .cache_first(request, &self.core_partition, event)
          .await
      }
      ResourceClass::LargeModelAsset => {
        self
          .layer
          .cache_first(request, &self.runtime_partition, event)
          .await
      }
      ResourceClass::Dynamic => {
        self
          .layer
          .network_first(request, &self.runtime_partition, event)
          .await
      }
    }
  }

  /// Cached app shell from any partition.
  fn shell(&self) -> Option<Response> {
    let key = CacheKey::for_request(&Request::get(self.shell_url.clone()));
    match self.storage.match_any(&key) {
      Ok(found) => found,
      Err(e) => {
        warn!("Failed to look up app shell: {}", e);
        None
      }
    }
  }

  pub fn on_message(&self, event: &MessageEvent) {
    debug!("Message received: {}", event.command.name());
    match event.command {
      Command::SkipWaiting => {
        info!("Skip waiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
      }
      Command::ClearCache => {
        let storage = Arc::clone(&self.storage);
        event.extend.wait_until(async move {
          if let Err(e) = clear_all(storage.as_ref()) {
            error!("Failed to clear caches: {}", e);
          }
        });
      }
    }
  }
}

/// Delete every partition, whatever its version.
fn clear_all<S: CacheStorage>(storage: &S) -> Result<()> {
  let names = storage.keys()?;
  for name in &names {
    storage.delete(name)?;
  }
  info!("Cleared {} partitions", names.len());
  Ok(())
}
