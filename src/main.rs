mod cache;
mod classify;
mod commands;
mod config;
mod http;
mod lifecycle;
mod router;
mod runtime;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheStorage, MemoryStorage, Registry, SqliteStorage};
use http::{HttpNetwork, Request};
use runtime::Host;

#[derive(Parser, Debug)]
#[command(name = "offline-cache")]
#[command(about = "Offline cache router for web app shells and large model assets")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Keep partitions in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install/activate the configured version if needed and show its state
  Start,
  /// Fetch a URL through the router
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    document: bool,
    /// HTTP method; anything but GET bypasses the router
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Write the body to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Post a command to the router (SKIP_WAITING, CLEAR_CACHE)
  Message { command: String },
  /// List cache partitions
  Partitions,
  /// List the entries of a partition
  Entries { partition: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_logging(args.verbose, config.log_dir.as_deref());

  if args.ephemeral {
    run(args, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = SqliteStorage::open(config.storage.path.as_deref())?;
    run(args, &config, Arc::new(storage)).await
  }
}

/// Stderr logging, plus a daily log file when `log_dir` is set.
///
/// `RUST_LOG` takes precedence over `-v`.
fn init_logging(verbose: u8, log_dir: Option<&Path>) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(match verbose {
      0 => "offline_cache=warn",
      1 => "offline_cache=info",
      _ => "offline_cache=debug",
    })
  });

  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offline-cache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry().with(filter).with(stderr).init();
      None
    }
  }
}

async fn run<S>(args: Args, config: &config::Config, storage: Arc<S>) -> Result<()>
where
  S: CacheStorage + Registry,
{
  match &args.command {
    Command::Partitions => return list_partitions(storage.as_ref()),
    Command::Entries { partition } => return list_entries(storage.as_ref(), partition),
    _ => {}
  }

  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let mut host = Host::new(config, Arc::clone(&storage), network)?;

  if let Some(report) = host.start().await? {
    for (url, reason) in &report.failed {
      eprintln!("not cached: {} ({})", url, reason);
    }
  }

  match args.command {
    Command::Start => {
      println!("version:  {}", host.version());
      println!("state:    {}", host.state());
      println!("core:     {}", host.router().core_partition());
      println!("runtime:  {}", host.router().runtime_partition());
      if let Some(previous) = host.previous() {
        println!("previous: {} ({})", previous.version, previous.state);
      }
    }
    Command::Fetch {
      url,
      document,
      method,
      output,
    } => {
      let method = method
        .to_uppercase()
        .parse::<reqwest::Method>()
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::parse(&url)?.with_method(method);
      if document {
        request = request.document();
      }

      let response = host.fetch(request).await?;
      eprintln!("{} {}", response.status, response.status_text);
      for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
      }

      match output {
        Some(path) => {
          std::fs::write(&path, &response.body)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
          eprintln!(
            "wrote {} bytes ({}) to {}",
            response.body.len(),
            response.header("content-type").unwrap_or("unknown type"),
            path.display()
          );
        }
        None => std::io::stdout()
          .write_all(&response.body)
          .map_err(|e| eyre!("Failed to write body: {}", e))?,
      }
    }
    Command::Message { command } => {
      host.post_message(&command).await?;
      println!("state: {}", host.state());
    }
    Command::Partitions | Command::Entries { .. } => {}
  }

  Ok(())
}

fn list_partitions<S: CacheStorage>(storage: &S) -> Result<()> {
  for name in storage.keys()? {
    let entries = storage.entries(&name)?;
    let bytes: usize = entries.iter().map(|e| e.size).sum();
    println!("{}\t{} entries\t{} bytes", name, entries.len(), bytes);
  }
  Ok(())
}

fn list_entries<S: CacheStorage>(storage: &S, partition: &str) -> Result<()> {
  for entry in storage.entries(partition)? {
    println!(
      "{}\t{}\t{}\t{}",
      entry.status,
      entry.size,
      entry.cached_at.format("%Y-%m-%d %H:%M:%S"),
      entry.key
    );
  }
  Ok(())
}
