use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use chat_offline::cache::{
  CachePolicyEngine, CacheRequest, CachedResponse, Fetcher, HttpFetcher, SqliteHttpCache,
};
use chat_offline::config::Config;
use chat_offline::error::FetchError;
use chat_offline::interceptor::{
  InterceptorHandle, InterceptorMessage, Registration, WorkerConfig, WorkerState,
};
use chat_offline::model::{Message, NewThread, Role};
use chat_offline::store::Store;
use chat_offline::sync::{
  ConnectivityEvent, ConnectivityMonitor, HttpRemoteStore, StatusBroadcaster, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(name = "chat-offline")]
#[command(about = "Offline queue, sync and HTTP cache for a chat client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/chat-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as if the network were down: writes are queued, fetches fail
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show sync status
  Status,
  /// List queued actions, including failed ones
  Queue,
  /// Replay the queue now
  Sync {
    /// Keep running and drain on the configured interval until Ctrl-C
    #[arg(long)]
    watch: bool,
  },
  /// Requeue failed actions
  Retry {
    /// Drop failed actions instead of retrying them
    #[arg(long)]
    clear: bool,
  },
  /// Send a message to a thread
  Send {
    thread: String,
    content: String,
    #[arg(long, default_value = "user")]
    role: String,
  },
  /// Create a thread
  CreateThread {
    title: String,
    #[arg(long)]
    project: Option<String>,
    /// First message of the thread
    #[arg(long)]
    message: Option<String>,
  },
  DeleteThread {
    thread: String,
  },
  /// Change a thread's title
  Rename {
    thread: String,
    title: String,
  },
  /// Refetch threads from the server and list the cached copies
  Refresh,
  /// Fetch a URL through the cache policy
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Precache URLs
  Warm {
    urls: Vec<String>,
  },
  /// Remove expired entries and outdated caches
  Cleanup,
  /// Install the request interceptor and print its status
  InterceptorStatus,
}

/// Fetcher used with `--offline`.
struct Disconnected;

#[async_trait]
impl Fetcher for Disconnected {
  async fn fetch(&self, _request: &CacheRequest) -> Result<CachedResponse, FetchError> {
    Err(FetchError::Network("offline".to_string()))
  }
}

struct App {
  config: Config,
  origin: Url,
  engine: SyncEngine,
  monitor: ConnectivityMonitor,
  policy: CachePolicyEngine,
}

impl App {
  fn new(config: Config, offline: bool) -> Result<Self> {
    let data_dir = config.data_dir();
    let origin = config.cache.origin()?;

    let store = Store::open(&data_dir.join("offline.db"), config.cache.quota_bytes);
    let remote = HttpRemoteStore::new(
      config.remote.base_url()?,
      Config::get_api_token(),
      config.remote.timeout(),
    )
    .map_err(|e| eyre!("Failed to create remote client: {}", e))?;
    let engine = SyncEngine::new(store.clone(), Arc::new(remote), StatusBroadcaster::default())
      .with_max_retries(config.sync.max_retries);
    let monitor = ConnectivityMonitor::new(
      engine.clone(),
      Duration::from_secs(config.sync.interval_secs),
    );
    if !offline {
      engine.status().update(|s| s.is_online = true);
    }

    let http_cache = SqliteHttpCache::open(&data_dir.join("http-cache.db"), config.cache.quota_bytes)?;
    let fetcher: Arc<dyn Fetcher> = if offline {
      Arc::new(Disconnected)
    } else {
      Arc::new(HttpFetcher::new(origin.clone(), config.remote.timeout())?)
    };
    let policy = CachePolicyEngine::new(Arc::new(http_cache), fetcher)
      .with_settings(config.cache.policy_settings())
      .with_durable_store(store);

    Ok(Self {
      config,
      origin,
      engine,
      monitor,
      policy,
    })
  }

  async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Status => {
        let sync = self.engine.refresh_status().await;
        let storage = self.policy.estimate().await?;
        print_json(&serde_json::json!({ "sync": sync, "storage": storage }))?;
      }
      Command::Queue => {
        for action in self.engine.queued_actions().await {
          println!(
            "{}  {:<14} {:<10} thread={} retries={}/{} {}",
            action.timestamp.to_rfc3339(),
            action.kind.name(),
            action.status.as_str(),
            action.thread_id.as_deref().unwrap_or("-"),
            action.retry_count,
            action.max_retries,
            action.error.as_deref().unwrap_or(""),
          );
        }
      }
      Command::Sync { watch } => self.sync(watch).await?,
      Command::Retry { clear } => {
        let n = if clear {
          self.engine.clear_failed().await
        } else {
          self.engine.retry_failed().await
        };
        println!("{} failed action(s) {}", n, if clear { "cleared" } else { "requeued" });
      }
      Command::Send {
        thread,
        content,
        role,
      } => {
        let role = parse_role(&role)?;
        let message = Message::new(role, content, Utc::now());
        self
          .engine
          .send_message(self.config.require_user_id()?, &thread, message)
          .await?;
        self.print_outcome().await;
      }
      Command::CreateThread {
        title,
        project,
        message,
      } => {
        let mut draft = NewThread::titled(title);
        draft.project_id = project;
        draft.initial_message = message.map(|m| Message::new(Role::User, m, Utc::now()));
        let thread = self
          .engine
          .create_thread(self.config.require_user_id()?, draft)
          .await?;
        print_json(&thread)?;
      }
      Command::DeleteThread { thread } => {
        self
          .engine
          .delete_thread(self.config.require_user_id()?, &thread)
          .await?;
        self.print_outcome().await;
      }
      Command::Rename { thread, title } => {
        self
          .engine
          .update_thread_title(self.config.require_user_id()?, &thread, &title)
          .await?;
        self.print_outcome().await;
      }
      Command::Refresh => {
        let user_id = self.config.require_user_id()?;
        for conversation in self.engine.refresh_threads(user_id).await {
          println!(
            "{}  {:<8} {}",
            conversation.id,
            conversation.sync_state.as_str(),
            conversation.thread.title
          );
        }
      }
      Command::Fetch { url, navigate } => self.fetch(&url, navigate).await?,
      Command::Warm { urls } => {
        let urls = urls
          .iter()
          .map(|u| self.resolve(u))
          .collect::<Result<Vec<_>>>()?;
        let report = self.policy.warm_cache(&urls).await;
        print_json(&report)?;
      }
      Command::Cleanup => {
        let expired = self.policy.cleanup_expired().await?;
        let outdated = self.policy.delete_outdated_caches().await?;
        println!("removed {} expired entries, {} outdated caches", expired, outdated.len());
      }
      Command::InterceptorStatus => match self.interceptor().await {
        Some(worker) => {
          let reply = worker.post(InterceptorMessage::GetStatus).await?;
          print_json(&reply)?;
        }
        None => println!("interceptor failed to install"),
      },
    }
    Ok(())
  }

  async fn sync(&self, watch: bool) -> Result<()> {
    let Some(drain) = self.monitor.handle(ConnectivityEvent::Online) else {
      return Ok(());
    };
    let report = drain.await?;
    print_json(&report)?;
    if !watch {
      return Ok(());
    }

    let _subscription = self.engine.status().subscribe(|status| {
      println!(
        "online={} queued={} syncing={} conflicts={}",
        status.is_online, status.queued_actions_count, status.sync_in_progress, status.has_conflicts
      );
    });
    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    self.monitor.handle(ConnectivityEvent::Offline);
    Ok(())
  }

  async fn fetch(&self, url: &str, navigate: bool) -> Result<()> {
    let url = self.resolve(url)?;
    let request = if navigate {
      CacheRequest::navigate(url)
    } else {
      CacheRequest::get(url)
    };

    let result = match self.interceptor().await {
      Some(worker) => worker.fetch(request).await?,
      None => {
        tracing::warn!("No active interceptor, applying cache policy in-process");
        self.policy.handle(&request).await?
      }
    };
    println!(
      "{} {:?} ({} bytes)",
      result.response.status,
      result.source,
      result.response.body.len()
    );
    Ok(())
  }

  /// Register an interceptor and wait for it to take control.
  async fn interceptor(&self) -> Option<InterceptorHandle> {
    let registration = Registration::new();
    let precache = match self.config.cache.precache_urls() {
      Ok(urls) => urls,
      Err(e) => {
        tracing::warn!("Invalid precache list: {}", e);
        return None;
      }
    };
    let worker = registration.register(
      self.policy.clone(),
      WorkerConfig {
        origin: self.origin.clone(),
        precache,
        auto_activate: self.config.cache.auto_activate,
      },
    );

    if worker.wait_until(WorkerState::Installed).await == WorkerState::Redundant {
      return None;
    }
    if worker.state() == WorkerState::Installed {
      // Nothing else controls this process, so activate right away.
      let _ = worker.post(InterceptorMessage::SkipWaiting).await;
    }
    match worker.wait_until(WorkerState::Activated).await {
      WorkerState::Activated => Some(worker),
      _ => None,
    }
  }

  fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid URL {}: {}", target, e))
  }

  async fn print_outcome(&self) {
    let status = self.engine.refresh_status().await;
    if status.queued_actions_count == 0 {
      println!("ok");
    } else {
      println!("ok ({} action(s) queued)", status.queued_actions_count);
    }
  }
}

fn parse_role(role: &str) -> Result<Role> {
  match role {
    "user" => Ok(Role::User),
    "assistant" => Ok(Role::Assistant),
    "system" => Ok(Role::System),
    other => Err(eyre!("Unknown role: {}", other)),
  }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = chat_offline::logging::init(&config.data_dir().join("logs"))?;

  let app = App::new(config, args.offline)?;
  app.run(args.command).await?;

  Ok(())
}
