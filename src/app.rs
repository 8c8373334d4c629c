use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use gh_mirror::cache::{
  CacheError, CacheStatus, DurableStore, NoopStore, ResourceCache, SqliteStore, SyncOptions, SyncReport,
};
use gh_mirror::config::Config;
use gh_mirror::engine::{Engine, TracingSink};
use gh_mirror::remote::{GitHubClient, IssueSource, MilestoneSource, ReleaseSource};
use gh_mirror::workflows::{self, Workspace};

/// Which mirrored collection a command applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Collection {
  Issues,
  Milestones,
  Releases,
  All,
}

impl Collection {
  fn includes(self, other: Collection) -> bool {
    self == Collection::All || self == other
  }
}

/// Per-collection result, keyed by collection name in the output
#[derive(Debug, Serialize)]
pub struct PerCollection<T> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub issues: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub milestones: Option<T>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub releases: Option<T>,
}

impl<T> PerCollection<T> {
  fn empty() -> Self {
    Self {
      issues: None,
      milestones: None,
      releases: None,
    }
  }
}

/// Wired-up caches, client and engine
pub struct App {
  pub config: Config,
  pub client: GitHubClient,
  pub issues: ResourceCache<IssueSource>,
  pub milestones: ResourceCache<MilestoneSource>,
  pub releases: ResourceCache<ReleaseSource>,
  pub engine: Engine,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let token = Config::api_token();
    if token.is_none() {
      info!("no GitHub token set, using anonymous access");
    }

    let client = GitHubClient::new(&config.github, token, config.retry.policy())
      .map_err(|e| eyre!("Failed to create GitHub client: {}", e))?;

    let store: Arc<dyn DurableStore> = if config.cache.persist {
      let store = match &config.cache.path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
      }
      .map_err(|e| eyre!("Failed to open cache database: {}", e))?;
      Arc::new(store)
    } else {
      Arc::new(NoopStore)
    };

    let options = config.cache.options();
    let issues = ResourceCache::new(IssueSource::new(client.clone()), Arc::clone(&store), options.clone());
    let milestones = ResourceCache::new(MilestoneSource::new(client.clone()), Arc::clone(&store), options.clone());
    let releases = ResourceCache::new(ReleaseSource::new(client.clone()), store, options);

    let engine = Engine::with_sink(Arc::new(TracingSink));
    let writer = Arc::new(client.clone());
    workflows::register_all(&engine, issues.clone(), writer, Workspace::from_config(&config.workspace));

    info!(repository = %client.repository(), "gh-mirror ready");
    Ok(Self {
      config,
      client,
      issues,
      milestones,
      releases,
      engine,
    })
  }

  pub async fn sync(&self, collection: Collection, opts: SyncOptions) -> Result<PerCollection<SyncReport>> {
    let mut reports = PerCollection::empty();
    if collection.includes(Collection::Issues) {
      reports.issues = Some(self.issues.sync(opts).await?);
    }
    if collection.includes(Collection::Milestones) {
      reports.milestones = Some(self.milestones.sync(opts).await?);
    }
    if collection.includes(Collection::Releases) {
      reports.releases = Some(self.releases.sync(opts).await?);
    }
    Ok(reports)
  }

  pub fn status(&self, collection: Collection) -> Result<PerCollection<CacheStatus>> {
    self.per_collection(collection, |cache| cache.status(), |c| c.status(), |c| c.status())
  }

  pub fn clear(&self, collection: Collection) -> Result<PerCollection<bool>> {
    self.per_collection(
      collection,
      |c| c.clear().map(|_| true),
      |c| c.clear().map(|_| true),
      |c| c.clear().map(|_| true),
    )
  }

  fn per_collection<T>(
    &self,
    collection: Collection,
    issues: impl FnOnce(&ResourceCache<IssueSource>) -> Result<T, CacheError>,
    milestones: impl FnOnce(&ResourceCache<MilestoneSource>) -> Result<T, CacheError>,
    releases: impl FnOnce(&ResourceCache<ReleaseSource>) -> Result<T, CacheError>,
  ) -> Result<PerCollection<T>> {
    let mut out = PerCollection::empty();
    if collection.includes(Collection::Issues) {
      out.issues = Some(issues(&self.issues)?);
    }
    if collection.includes(Collection::Milestones) {
      out.milestones = Some(milestones(&self.milestones)?);
    }
    if collection.includes(Collection::Releases) {
      out.releases = Some(releases(&self.releases)?);
    }
    Ok(out)
  }

  /// Memory sweepers for every collection; they stop when the app is dropped.
  pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
    let interval = self.config.cache.sweep_interval();
    vec![
      self.issues.spawn_sweeper(interval),
      self.milestones.spawn_sweeper(interval),
      self.releases.spawn_sweeper(interval),
    ]
  }
}
