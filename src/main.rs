use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use offline_query::cache::{
  Connectivity, MutationResult, Persister, QueryClient, RestoreOutcome, SqliteStorage,
};
use offline_query::config::Config;
use offline_query::users::{CachedUserClient, User, UserApi, UserKeys};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "offline-query")]
#[command(about = "Offline-first cached access to the users API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offline-query/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Act as if the network were unavailable: serve from cache, queue writes
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show a user, from cache when fresh
  Get { id: String },
  /// Rename a user; queued for later when offline
  Put {
    id: String,
    #[arg(long)]
    name: String,
  },
  /// Replay queued writes
  Resume,
  /// List cached entries and queued writes
  Status,
  /// Remove the persisted cache
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_file.as_deref())?;

  let db_path = match &config.persistence.path {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path().ok_or_else(|| eyre!("Could not determine data directory"))?,
  };
  let storage = SqliteStorage::open(&db_path)?;
  let persister = Persister::new(Arc::new(storage))
    .with_key(config.persistence.key.clone())
    .with_buster(config.persistence.buster.clone())
    .with_max_age(config.persistence.max_age());

  let cache = QueryClient::builder()
    .with_config(config.client_config())
    .with_persister(persister.clone())
    .with_connectivity(Connectivity::new(!args.offline))
    .build();
  let users = CachedUserClient::new(UserApi::new(&config.api.url)?, cache.clone());

  match cache.restore().await {
    RestoreOutcome::Restored {
      entries,
      paused_mutations,
    } => info!(entries, paused_mutations, db = %db_path.display(), "loaded cache"),
    RestoreOutcome::Failed(err) => eprintln!("warning: cached data could not be loaded: {}", err),
    _ => {}
  }

  if cache.is_online() {
    report_resume(cache.resume_paused_mutations().await);
  }

  let outcome = run(&args.command, &users, &persister).await;
  cache.shutdown().await;
  outcome
}

async fn run(command: &Command, users: &CachedUserClient<UserApi>, persister: &Persister) -> Result<()> {
  let cache = users.cache();

  match command {
    Command::Get { id } => {
      let state = users.get_user(id).await;
      match (state.data(), state.error()) {
        (Some(user), _) => print_user(user, state.is_invalidated),
        (None, Some(err)) => return Err(eyre!("Failed to get user {}: {}", id, err)),
        (None, None) => println!("user {} is not cached (offline)", id),
      }
    }
    Command::Put { id, name } => {
      let mut user = cache
        .get_query_data(&UserKeys::detail(id))
        .unwrap_or_else(|| User::new(id.clone(), name.clone()));
      user.name = name.clone();

      match users.update_user(user).await? {
        MutationResult::Committed(user) => {
          println!("saved");
          print_user(&user, false);
        }
        MutationResult::Paused(mutation) => println!("offline: queued write {}", mutation),
      }
    }
    Command::Resume => {
      if !cache.is_online() {
        return Err(eyre!("Cannot replay queued writes while offline"));
      }
      // Startup already replayed; this covers halted keys
      for key in cache.halted_keys() {
        report_resume(cache.retry_halted(&key).await);
      }
      println!("{} queued write(s) remaining", cache.paused_mutations().len());
    }
    Command::Status => {
      println!("online: {}", cache.is_online());
      println!("cached entries:");
      for entry in cache.entries() {
        let name = entry.data.as_ref().map(|u| u.name.as_str()).unwrap_or("-");
        let stale = if entry.is_invalidated { " (stale)" } else { "" };
        println!("  {} {:?} {}{}", entry.key, entry.status, name, stale);
      }
      println!("queued writes:");
      for mutation in cache.paused_mutations() {
        println!(
          "  {} {} name={} at {}",
          mutation.id, mutation.mutation_key, mutation.payload.name, mutation.submitted_at
        );
      }
      for key in cache.halted_keys() {
        println!("  halted: {}", key);
      }
    }
    Command::Clear => {
      cache.clear();
      persister.remove().await?;
      println!("cache cleared");
    }
  }

  Ok(())
}

fn print_user(user: &User, stale: bool) {
  println!("{}: {}{}", user.id, user.name, if stale { " (stale)" } else { "" });
}

fn report_resume(report: offline_query::cache::ResumeReport) {
  if !report.committed.is_empty() {
    println!("sent {} queued write(s)", report.committed.len());
  }
  for conflict in &report.conflicts {
    eprintln!("warning: {}", conflict);
  }
}

/// Log to `log_file` when set, otherwise to stderr. Filter with `RUST_LOG`.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new("offline_query=info"))
    .map_err(|e| eyre!("Failed to create tracing filter: {}", e))?;

  let Some(path) = log_file else {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  };

  let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
  let file_name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}
