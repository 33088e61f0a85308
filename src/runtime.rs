//! Host runtime: the in-process stand-in for the browser.
//!
//! Delivers lifecycle events to the router, waits for their extensions, and
//! persists which version is active so that a new deployment (a new cache
//! version in the config) is installed and activated on the next start.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, Registration, Registry};
use crate::commands::{self, Command};
use crate::config::Config;
use crate::http::{Network, Request, Response};
use crate::lifecycle::{FetchEvent, MessageEvent, WorkerState};
use crate::router::{InstallReport, Router};

/// A version known to the host other than the one it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousWorker {
  pub version: String,
  pub state: WorkerState,
}

pub struct Host<S, N>
where
  S: CacheStorage + Registry,
  N: Network,
{
  config: Config,
  router: Router<S, N>,
  /// Router of the still-active previous version while this one waits
  fallback: Option<Router<S, N>>,
  storage: Arc<S>,
  network: Arc<N>,
  version: String,
  state: WorkerState,
  previous: Option<PreviousWorker>,
}

impl<S, N> Host<S, N>
where
  S: CacheStorage + Registry,
  N: Network,
{
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let router = Router::new(config, Arc::clone(&storage), Arc::clone(&network))?;

    Ok(Self {
      config: config.clone(),
      router,
      fallback: None,
      storage,
      network,
      version: config.version.clone(),
      state: WorkerState::Uninitialized,
      previous: None,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// The version this one replaced (or is waiting on), if any.
  pub fn previous(&self) -> Option<&PreviousWorker> {
    self.previous.as_ref()
  }

  pub fn router(&self) -> &Router<S, N> {
    &self.router
  }

  /// Bring this version up to date with the persisted registration.
  ///
  /// Returns the install report when an install had to run.
  pub async fn start(&mut self) -> Result<Option<InstallReport>> {
    let registration = self.storage.load_registration()?;
    debug!(?registration, version = %self.version, "Starting host");

    if let Some(active) = registration.active.as_deref() {
      if active != self.version {
        self.previous = Some(PreviousWorker {
          version: active.to_string(),
          state: WorkerState::Active,
        });
      }
    }

    if registration.active.as_deref() == Some(self.version.as_str()) {
      // Already installed and activated by an earlier run
      self.state = WorkerState::Active;
      self.router.claim();
      return Ok(None);
    }

    let report = if registration.waiting.as_deref() == Some(self.version.as_str()) {
      self.state = WorkerState::Waiting;
      None
    } else {
      Some(self.install().await?)
    };

    match self.previous.clone() {
      Some(previous) if !self.router.skip_waiting_requested() => {
        info!(
          "Version {} installed and waiting for {} to release control",
          self.version, previous.version
        );
        self.fallback = Some(self.router_for(&previous.version)?);
      }
      _ => self.activate().await?,
    }

    Ok(report)
  }

  /// A claimed router over `version`'s partitions, same rules otherwise.
  fn router_for(&self, version: &str) -> Result<Router<S, N>> {
    let mut config = self.config.clone();
    config.version = version.to_string();
    let router = Router::new(&config, Arc::clone(&self.storage), Arc::clone(&self.network))?;
    router.claim();
    Ok(router)
  }

  async fn install(&mut self) -> Result<InstallReport> {
    self.state.advance(WorkerState::Installing)?;
    let report = self.router.on_install().await;
    self.state.advance(WorkerState::Waiting)?;

    let mut registration = self.storage.load_registration()?;
    registration.waiting = Some(self.version.clone());
    self.storage.store_registration(&registration)?;

    Ok(report)
  }

  async fn activate(&mut self) -> Result<()> {
    if self.state != WorkerState::Waiting {
      return Err(eyre!(
        "Cannot activate version {} while {}",
        self.version,
        self.state
      ));
    }

    // Stale-partition cleanup is best effort; the version still takes over.
    if let Err(e) = self.router.on_activate().await {
      warn!("Activation cleanup failed: {}", e);
    }
    self.state.advance(WorkerState::Active)?;
    self.fallback = None;

    if let Some(previous) = self.previous.as_mut() {
      previous.state.advance(WorkerState::Superseded)?;
      info!("Version {} superseded by {}", previous.version, self.version);
    }

    self.storage.store_registration(&Registration {
      active: Some(self.version.clone()),
      waiting: None,
    })?;

    Ok(())
  }

  /// Issue a request as a page controlled by this host would.
  ///
  /// While this version waits, the previous version keeps serving. Requests
  /// no router intercepts go straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Response> {
    let controlling = match self.state {
      WorkerState::Active if self.router.controls_clients() => Some(&self.router),
      WorkerState::Waiting => self.fallback.as_ref(),
      _ => None,
    };

    if let Some(router) = controlling {
      let event = FetchEvent::new(request);
      let intercepted = router.on_fetch(&event).await;
      debug!(pending = event.extend.pending(), "Settling fetch event");
      event.extend.settle().await;

      if let Some(response) = intercepted {
        return Ok(response);
      }
      debug!("Not intercepted: {}", event.request.url);
      return self.network.fetch(&event.request).await;
    }

    debug!(state = %self.state, "Router not in control: {}", request.url);
    self.network.fetch(&request).await
  }

  /// Post a string-tagged command to the router. Unknown commands are
  /// ignored with a warning.
  pub async fn post_message(&mut self, input: &str) -> Result<()> {
    let Some(command) = commands::parse(input) else {
      let known: Vec<String> = commands::COMMANDS
        .iter()
        .map(|c| format!("{} ({})", c.name, c.description))
        .collect();
      warn!(
        "Ignoring unknown command '{}', expected one of: {}",
        input.trim(),
        known.join(", ")
      );
      return Ok(());
    };

    let event = MessageEvent::new(command);
    self.router.on_message(&event);
    event.extend.settle().await;

    if command == Command::ClearCache {
      // Full reset: forget the registration so the next start installs again
      self.storage.store_registration(&Registration::default())?;
      info!("Registration cleared, next start reinstalls {}", self.version);
    }

    if self.state == WorkerState::Waiting && self.router.skip_waiting_requested() {
      self.activate().await?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, MemoryStorage, SqliteStorage};
  use crate::http::testing::FakeNetwork;

  fn config(version: &str, skip_waiting: bool) -> Config {
    let mut config = Config::from_yaml(&format!(
      "origin: https://someone.github.io\n\
       version: {}\n\
       core_prefix: core\n\
       runtime_prefix: runtime\n\
       core_assets: ['/index.html']\n\
       cdn_resources: []\n",
      version
    ))
    .unwrap();
    config.skip_waiting_on_install = skip_waiting;
    config
  }

  fn network() -> Arc<FakeNetwork> {
    Arc::new(FakeNetwork::new().ok("https://someone.github.io/index.html", "<html>"))
  }

  #[tokio::test]
  async fn test_first_start_installs_and_activates() {
    let storage = Arc::new(MemoryStorage::new());
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), network()).unwrap();

    let report = host.start().await.unwrap().unwrap();

    assert_eq!(report.cached.len(), 1);
    assert_eq!(host.state(), WorkerState::Active);
    assert!(host.previous().is_none());
    assert_eq!(
      storage.load_registration().unwrap(),
      Registration {
        active: Some("v1".to_string()),
        waiting: None,
      }
    );
  }

  #[tokio::test]
  async fn test_restart_with_same_version_skips_install() {
    let storage = Arc::new(MemoryStorage::new());
    let net = network();
    Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net))
      .unwrap()
      .start()
      .await
      .unwrap();

    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    assert!(host.start().await.unwrap().is_none());
    assert_eq!(host.state(), WorkerState::Active);
    assert!(host.router().controls_clients());
    assert_eq!(net.calls(), 1);
  }

  #[tokio::test]
  async fn test_restart_serves_offline_from_persisted_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");
    let net = network();

    {
      let storage = Arc::new(SqliteStorage::open(Some(&db)).unwrap());
      let mut host = Host::new(&config("v1", true), storage, Arc::clone(&net)).unwrap();
      host.start().await.unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(Some(&db)).unwrap());
    let mut host = Host::new(&config("v1", true), storage, Arc::clone(&net)).unwrap();
    assert!(host.start().await.unwrap().is_none());

    net.set_offline(true);
    let shell = host
      .fetch(Request::parse("https://someone.github.io/index.html").unwrap().document())
      .await
      .unwrap();
    assert_eq!(shell.status, 200);
    assert_eq!(&shell.body[..], b"<html>");

    let missing = host
      .fetch(Request::parse("https://someone.github.io/missing.js").unwrap())
      .await
      .unwrap();
    assert_eq!(missing.status, 503);
  }

  #[tokio::test]
  async fn test_version_bump_rolls_partitions_over() {
    let storage = Arc::new(MemoryStorage::new());
    Host::new(&config("v1", true), Arc::clone(&storage), network())
      .unwrap()
      .start()
      .await
      .unwrap();
    storage.open("runtime-v1").unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["core-v1", "runtime-v1"]);

    let mut host = Host::new(&config("v2", true), Arc::clone(&storage), network()).unwrap();
    host.start().await.unwrap();

    assert_eq!(host.state(), WorkerState::Active);
    assert_eq!(
      host.previous(),
      Some(&PreviousWorker {
        version: "v1".to_string(),
        state: WorkerState::Superseded,
      })
    );
    assert_eq!(storage.keys().unwrap(), vec!["core-v2"]);
  }

  #[tokio::test]
  async fn test_new_version_waits_without_skip_waiting() {
    let storage = Arc::new(MemoryStorage::new());
    Host::new(&config("v1", true), Arc::clone(&storage), network())
      .unwrap()
      .start()
      .await
      .unwrap();

    let mut host = Host::new(&config("v2", false), Arc::clone(&storage), network()).unwrap();
    host.start().await.unwrap();

    assert_eq!(host.state(), WorkerState::Waiting);
    assert_eq!(
      storage.load_registration().unwrap(),
      Registration {
        active: Some("v1".to_string()),
        waiting: Some("v2".to_string()),
      }
    );
    // Old generation is untouched while waiting
    assert!(storage.keys().unwrap().contains(&"core-v1".to_string()));

    host.post_message("SKIP_WAITING").await.unwrap();

    assert_eq!(host.state(), WorkerState::Active);
    assert_eq!(storage.keys().unwrap(), vec!["core-v2"]);
    assert_eq!(
      storage.load_registration().unwrap().active.as_deref(),
      Some("v2")
    );
  }

  #[tokio::test]
  async fn test_waiting_version_is_not_reinstalled() {
    let storage = Arc::new(MemoryStorage::new());
    storage
      .store_registration(&Registration {
        active: Some("v1".to_string()),
        waiting: Some("v2".to_string()),
      })
      .unwrap();

    let net = network();
    let mut host = Host::new(&config("v2", false), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    assert!(host.start().await.unwrap().is_none());
    assert_eq!(host.state(), WorkerState::Waiting);
    assert_eq!(net.calls(), 0);
  }

  #[tokio::test]
  async fn test_previous_version_serves_while_new_one_waits() {
    let shell = "https://someone.github.io/index.html";
    let storage = Arc::new(MemoryStorage::new());
    let old_net = Arc::new(FakeNetwork::new().ok(shell, "v1 shell"));
    Host::new(&config("v1", true), Arc::clone(&storage), old_net)
      .unwrap()
      .start()
      .await
      .unwrap();

    let net = Arc::new(FakeNetwork::new().ok(shell, "v2 shell"));
    let mut host = Host::new(&config("v2", false), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    host.start().await.unwrap();
    assert_eq!(host.state(), WorkerState::Waiting);

    net.set_offline(true);
    let waiting = host
      .fetch(Request::parse("https://someone.github.io/about").unwrap().document())
      .await
      .unwrap();
    assert_eq!(&waiting.body[..], b"v1 shell");

    host.post_message("SKIP_WAITING").await.unwrap();
    let active = host
      .fetch(Request::parse(shell).unwrap().document())
      .await
      .unwrap();
    assert_eq!(&active.body[..], b"v2 shell");
  }

  #[tokio::test]
  async fn test_offline_navigation_through_host() {
    let storage = Arc::new(MemoryStorage::new());
    let net = network();
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    host.start().await.unwrap();

    net.set_offline(true);
    let response = host
      .fetch(Request::parse("https://someone.github.io/solve/42").unwrap().document())
      .await
      .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"<html>");
  }

  #[tokio::test]
  async fn test_pass_through_request_hits_network() {
    let storage = Arc::new(MemoryStorage::new());
    let net = Arc::new(
      FakeNetwork::new()
        .ok("https://someone.github.io/index.html", "<html>")
        .ok("https://someone.github.io/api/history", "saved"),
    );
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    host.start().await.unwrap();

    let post = Request::parse("https://someone.github.io/api/history")
      .unwrap()
      .with_method(reqwest::Method::POST);
    let response = host.fetch(post).await.unwrap();

    assert_eq!(&response.body[..], b"saved");
    assert!(storage
      .match_in(
        "runtime-v1",
        &CacheKey::for_request(&Request::parse("https://someone.github.io/api/history").unwrap())
      )
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_clear_cache_message_empties_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(Some(&dir.path().join("cache.db"))).unwrap());
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), network()).unwrap();
    host.start().await.unwrap();
    assert!(!storage.keys().unwrap().is_empty());

    host.post_message(r#"{"type":"CLEAR_CACHE"}"#).await.unwrap();

    assert!(storage.keys().unwrap().is_empty());
    assert_eq!(host.state(), WorkerState::Active);
  }

  #[tokio::test]
  async fn test_clear_cache_reinstalls_on_next_start() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");
    let net = network();

    {
      let storage = Arc::new(SqliteStorage::open(Some(&db)).unwrap());
      let mut host =
        Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net)).unwrap();
      host.start().await.unwrap();
      host.post_message("CLEAR_CACHE").await.unwrap();
      assert_eq!(storage.load_registration().unwrap(), Registration::default());
    }

    let storage = Arc::new(SqliteStorage::open(Some(&db)).unwrap());
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), Arc::clone(&net)).unwrap();
    let report = host.start().await.unwrap().unwrap();

    assert_eq!(report.cached.len(), 1);
    assert_eq!(host.state(), WorkerState::Active);
    assert_eq!(storage.keys().unwrap(), vec!["core-v1"]);
    assert_eq!(net.calls(), 2);
  }

  #[tokio::test]
  async fn test_unknown_message_is_ignored() {
    let storage = Arc::new(MemoryStorage::new());
    let mut host = Host::new(&config("v1", true), Arc::clone(&storage), network()).unwrap();
    host.start().await.unwrap();

    host.post_message("RELOAD").await.unwrap();

    assert_eq!(host.state(), WorkerState::Active);
    assert_eq!(storage.keys().unwrap(), vec!["core-v1"]);
  }
}
