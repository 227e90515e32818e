use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use lifeline::cache::{CacheStorage, MemoryStorage, SqliteStorage};
use lifeline::config::Config;
use lifeline::db::Database;
use lifeline::http::{ReqwestTransport, Request, WriteMethod};
use lifeline::offline::{
  BroadcastSink, HealthProbe, LinkEvent, ManagerOptions, NotificationSink, OfflineManager,
  SqliteQueueStore, TracingSink,
};
use lifeline::worker::{ServiceWorker, WorkerMessage, WorkerOptions};

#[derive(Parser, Debug)]
#[command(name = "lifeline")]
#[command(about = "Offline resilience for web apps: tiered caching and a replay queue for writes")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lifeline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  #[command(flatten)]
  Worker(WorkerCommand),

  #[command(flatten)]
  Offline(QueueCommand),
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Queue a write for delivery once the backend is reachable
  Enqueue {
    /// POST, PUT, PATCH or DELETE
    method: String,
    /// Path relative to the origin, e.g. /api/tasks
    endpoint: String,
    /// JSON body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// List queued writes
  Queue,
  /// Probe the backend and replay queued writes
  Sync,
  /// Monitor connectivity and replay writes until interrupted
  Watch,
}

#[derive(Subcommand, Debug)]
enum WorkerCommand {
  /// Prime the application shell and activate the current cache version
  Install,
  /// GET a URL (or origin-relative path) through the interception layer
  Fetch { target: String },
  /// List cache partitions and their entries
  Caches,
  /// Print the active cache version
  Version,
  /// Post a raw control message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lifeline=info"));

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));

  let appender = tracing_appender::rolling::never(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging(args.log_file.as_deref())?;

  let config = Config::load(args.config.as_deref())?;
  let data_dir = Database::data_dir(config.data_dir.as_deref())?;

  match args.command {
    Command::Worker(command) => {
      if config.cache.persist {
        let storage = SqliteStorage::open_at(&data_dir.join("caches.db"))?;
        run_worker(command, &config, storage).await
      } else {
        run_worker(command, &config, MemoryStorage::new()).await
      }
    }
    Command::Offline(command) => run_queue(command, &config, &data_dir).await,
  }
}

async fn run_worker<S: CacheStorage>(
  command: WorkerCommand,
  config: &Config,
  storage: S,
) -> Result<()> {
  let transport = ReqwestTransport::new()?;
  let worker = ServiceWorker::new(transport, Arc::new(storage), WorkerOptions::from_config(config)?);

  match command {
    WorkerCommand::Install => {
      worker.start().await?;
      println!("{} {}", worker.version(), worker.state());
    }
    WorkerCommand::Fetch { target } => {
      worker.resume().await?;

      let url = if target.contains("://") {
        Url::parse(&target)
      } else {
        config.origin_url()?.join(&target)
      }
      .map_err(|e| eyre!("Invalid fetch target '{}': {}", target, e))?;

      let result = worker.fetch(Request::get(url)).await?;
      let cached = result
        .cached_at
        .map(|at| format!(", cached {}", at.to_rfc3339()))
        .unwrap_or_default();
      eprintln!("{} ({}{})", result.data.status, result.source, cached);
      println!("{}", result.data.body_text());
    }
    WorkerCommand::Caches => {
      let storage = worker.storage();
      for name in storage.cache_names()? {
        let marker = if worker.version().is_stale(&name) { " (stale)" } else { "" };
        println!("{}{}", name, marker);
        for key in storage.keys(&name)? {
          println!("  {}", key);
        }
      }
    }
    WorkerCommand::Version => {
      worker.resume().await?;
      post_and_print(&worker, WorkerMessage::GetVersion).await?;
    }
    WorkerCommand::Message { json } => {
      let message = WorkerMessage::parse(&json)?;
      worker.resume().await?;
      post_and_print(&worker, message).await?;
    }
  }

  Ok(())
}

async fn post_and_print<S: CacheStorage>(
  worker: &ServiceWorker<ReqwestTransport, S>,
  message: WorkerMessage,
) -> Result<()> {
  let (tx, rx) = oneshot::channel();
  worker.post_message(message, Some(tx)).await?;

  // Only GET_VERSION answers; the sender is dropped otherwise
  if let Ok(reply) = rx.await {
    let json = serde_json::to_string(&reply)
      .map_err(|e| eyre!("Failed to serialize version reply: {}", e))?;
    println!("{}", json);
  } else {
    println!("{}", worker.state());
  }
  Ok(())
}

fn queue_manager(
  config: &Config,
  data_dir: &Path,
  sink: Arc<dyn NotificationSink>,
) -> Result<OfflineManager<Arc<ReqwestTransport>, HealthProbe<ReqwestTransport>>> {
  let transport = Arc::new(ReqwestTransport::new()?);
  let probe = HealthProbe::new(
    transport.clone(),
    config.health_url()?,
    Duration::from_secs(config.sync.probe_timeout_secs),
  );
  let store = SqliteQueueStore::open_at(&data_dir.join("offline.db"))?;

  Ok(OfflineManager::new(
    transport,
    probe,
    Arc::new(store),
    sink,
    ManagerOptions::from_config(config)?,
  ))
}

async fn run_queue(command: QueueCommand, config: &Config, data_dir: &Path) -> Result<()> {
  match command {
    QueueCommand::Enqueue {
      method,
      endpoint,
      data,
    } => {
      let method: WriteMethod = method.parse()?;
      if let Some(body) = &data {
        serde_json::from_str::<serde_json::Value>(body)
          .map_err(|e| eyre!("--data is not valid JSON: {}", e))?;
      }

      let manager = queue_manager(config, data_dir, Arc::new(TracingSink))?;
      let id = manager.enqueue(&endpoint, method, data)?;
      println!("{}", id);
      Ok(())
    }
    QueueCommand::Queue => {
      let manager = queue_manager(config, data_dir, Arc::new(TracingSink))?;
      let json = serde_json::to_string_pretty(&manager.pending())
        .map_err(|e| eyre!("Failed to serialize queue: {}", e))?;
      println!("{}", json);
      Ok(())
    }
    QueueCommand::Sync => {
      let manager = queue_manager(config, data_dir, Arc::new(TracingSink))?;
      if !manager.probe().await {
        println!("backend unreachable, {} operations pending", manager.pending_count());
        return Ok(());
      }

      match manager.on_link_event(LinkEvent::Up).await {
        Some(report) => println!(
          "delivered {}, failed {}, dropped {}, pending {}",
          report.delivered, report.failed, report.dropped, report.pending
        ),
        None => println!("nothing to sync"),
      }
      Ok(())
    }
    QueueCommand::Watch => watch(config, data_dir).await,
  }
}

async fn watch(config: &Config, data_dir: &Path) -> Result<()> {
  let sink = BroadcastSink::new(32);
  let mut notices = sink.subscribe();
  let manager = queue_manager(config, data_dir, Arc::new(sink))?;

  tokio::spawn(async move {
    loop {
      match notices.recv().await {
        Ok(notice) => println!("[{:?}] {}: {}", notice.kind, notice.title, notice.message),
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });

  let _status = manager.subscribe(|status| println!("status: {}", status));

  // Nothing feeds link events from a terminal; the sender keeps the channel open
  let (_events, rx) = mpsc::unbounded_channel::<LinkEvent>();
  manager.start(rx);
  info!(pending = manager.pending_count(), "watching connectivity");

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for interrupt: {}", e))?;
  manager.dispose();
  Ok(())
}
