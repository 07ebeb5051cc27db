use bytes::Bytes;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use lanesync::http::{HttpTransport, Request};
use lanesync::model::{Attachment, NewEntry};
use lanesync::{Config, MutationOutcome, SyncEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "lanesync")]
#[command(about = "Offline-first sync engine for the journal API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lanesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cache version, outbox and dead letters
  Status,
  /// Drain the outbox now, ignoring backoff
  Sync,
  /// Refresh and print the mirrored entries
  List,
  /// Fetch a URL through the cache router
  Fetch { url: String },
  /// Create an entry, queueing it if the server cannot be reached
  Create {
    text: String,
    /// Image to attach
    #[arg(long)]
    image: Option<PathBuf>,
    /// Make the entry public
    #[arg(long)]
    public: bool,
  },
  /// Delete an entry by id
  Delete { id: String },
  /// Activate a waiting cache version immediately
  Activate,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.storage.resolve_data_dir()?;
  let _log_guard = lanesync::logging::init(&config.logging, &data_dir)?;

  let transport = HttpTransport::new(Config::auth_token())?;
  let engine = SyncEngine::initialize(config, Arc::new(transport)).await?;
  if !engine.is_storage_available() {
    eprintln!("warning: local store unavailable, offline changes cannot be saved");
  }

  let result = run(&engine, args.command).await;
  engine.shutdown().await;
  result
}

async fn run(engine: &SyncEngine, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let lifecycle = engine.lifecycle();
      println!(
        "cache version: {}",
        lifecycle.active_version().unwrap_or_else(|| "none".to_string())
      );
      if let Some(waiting) = lifecycle.waiting_version() {
        println!("waiting version: {}", waiting);
      }
      let pending = engine.pending_operations()?;
      println!("pending operations: {}", pending.len());
      for op in &pending {
        println!(
          "  #{} {} {} (queued {})",
          op.id,
          op.kind().as_str(),
          op.target_id(),
          op.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
      let dead = engine.dead_letters()?;
      println!("dead letters: {}", dead.len());
      for letter in &dead {
        println!(
          "  #{} {} {} after {} attempts: {}",
          letter.operation.id,
          letter.operation.kind().as_str(),
          letter.operation.target_id(),
          letter.attempts,
          letter.reason
        );
      }
    }
    Command::Sync => {
      let report = engine.retry_now().await?;
      println!(
        "{:?}: {} replayed, {} failed, {} held, {} dead-lettered",
        report.outcome,
        report.replayed.len(),
        report.failed.len(),
        report.held.len(),
        report.dead_lettered.len()
      );
    }
    Command::List => {
      let entries = match engine.refresh_entries().await {
        Ok(entries) => entries,
        Err(e) => {
          eprintln!("refresh failed ({}), showing local copy", e);
          engine.entries()?
        }
      };
      for entry in entries {
        let marker = match entry.pending {
          Some(kind) => format!(" [pending {}]", kind.as_str()),
          None => String::new(),
        };
        let visibility = if entry.public { "public" } else { "private" };
        println!(
          "{} {} {}{}: {}",
          entry.id, entry.created_at, visibility, marker, entry.text_content
        );
      }
    }
    Command::Fetch { url } => {
      let routed = engine.fetch(Request::get(&url)?).await?;
      println!("{} via {:?}", routed.response.status, routed.source);
      if let Some(at) = routed.cached_at {
        println!("cached at {}", at.to_rfc3339());
      }
      println!("{}", String::from_utf8_lossy(&routed.response.body));
    }
    Command::Create {
      text,
      image,
      public,
    } => {
      let attachment = image.as_deref().map(read_attachment).transpose()?;
      let outcome = engine
        .create_entry(NewEntry {
          text,
          public,
          attachment,
        })
        .await?;
      print_outcome(&outcome);
    }
    Command::Delete { id } => {
      let outcome = engine.delete_entry(&id).await?;
      print_outcome(&outcome);
    }
    Command::Activate => match engine.lifecycle().skip_waiting() {
      Some(activation) => println!(
        "activated {} (evicted {})",
        activation.version,
        activation.evicted.join(", ")
      ),
      None => println!("no update waiting"),
    },
  }

  Ok(())
}

fn print_outcome(outcome: &MutationOutcome) {
  match outcome {
    MutationOutcome::Synced => println!("synced"),
    MutationOutcome::Queued {
      op_id,
      entity_id,
      reason,
    } => println!("queued as #{} for {} ({})", op_id, entity_id, reason),
  }
}

fn read_attachment(path: &Path) -> Result<Attachment> {
  let data = std::fs::read(path)
    .map_err(|e| eyre!("Failed to read image {}: {}", path.display(), e))?;
  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .ok_or_else(|| eyre!("Not a file: {}", path.display()))?;
  let content_type = match path
    .extension()
    .map(|e| e.to_string_lossy().to_lowercase())
    .as_deref()
  {
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("png") => "image/png",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    Some("svg") => "image/svg+xml",
    _ => "application/octet-stream",
  };

  Ok(Attachment {
    file_name,
    content_type: content_type.to_string(),
    data: Bytes::from(data),
  })
}
