//! Lodestone: local semantic search over your documents.

mod client;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use daemon::{Daemon, DaemonConfig, ExitCode};
use ipc::{EnqueueParams, Method, ProgressEvent, SearchParams, WatchOptions, WatchStartParams};
use lodestone_core::UserDataDirs;

#[derive(Parser)]
#[command(name = "lodestone", about = "Offline semantic search for your documents", version)]
struct Cli {
  /// User data directory (defaults to the platform data dir).
  #[arg(long, global = true, env = "LODESTONE_DATA_DIR")]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Run the indexing daemon.
  Daemon {
    #[command(subcommand)]
    command: DaemonCommand,
  },
  /// Watch and index one or more folders.
  Index {
    /// Root folders to watch.
    roots: Vec<PathBuf>,
    /// Extra exclude glob patterns.
    #[arg(long)]
    exclude: Vec<String>,
  },
  /// Search the index.
  Search {
    query: String,
    /// Number of results.
    #[arg(short, default_value_t = 10)]
    k: usize,
  },
  /// Show indexing progress and daemon state.
  Status,
  /// Show index statistics.
  Stats,
  /// List watched folders.
  Folders,
  /// Queue specific files for indexing.
  Enqueue { paths: Vec<PathBuf> },
  /// Pause indexing.
  Pause,
  /// Resume indexing.
  Resume,
  /// Clear the index and re-index every watched folder.
  ReindexAll,
  /// Stop the daemon gracefully.
  Shutdown,
}

#[derive(Subcommand)]
enum DaemonCommand {
  /// Run in the foreground (logs to console).
  Run {
    /// Log to files instead of the console.
    #[arg(long)]
    background: bool,
    /// Path to the embed-worker binary.
    #[arg(long, env = "LODESTONE_WORKER_BIN")]
    worker_bin: Option<PathBuf>,
  },
}

fn main() {
  let cli = Cli::parse();
  let dirs = match &cli.data_dir {
    Some(dir) => UserDataDirs::new(dir.clone()),
    None => UserDataDirs::resolve(),
  };

  let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
  let code = runtime.block_on(run(cli, dirs));
  std::process::exit(code);
}

async fn run(cli: Cli, dirs: UserDataDirs) -> i32 {
  match cli.command {
    Command::Daemon {
      command: DaemonCommand::Run { background, worker_bin },
    } => {
      let _ = dirs.ensure();
      let _guard = logging::init_daemon_logging(&dirs.logs_dir(), !background);
      logging::sweep_old_logs(&dirs.logs_dir(), 14);

      let exit = Daemon::new(DaemonConfig {
        user_data: dirs.root().to_path_buf(),
        worker_binary: worker_bin,
        eager_init: true,
      })
      .run()
      .await;
      exit as i32
    }
    command => {
      logging::init_cli_logging();
      match run_client_command(command, &dirs).await {
        Ok(()) => ExitCode::Clean as i32,
        Err(e) => {
          eprintln!("error: {e:#}");
          ExitCode::FatalInit as i32
        }
      }
    }
  }
}

async fn run_client_command(command: Command, dirs: &UserDataDirs) -> anyhow::Result<()> {
  let mut client = client::DaemonClient::connect(&dirs.socket_path()).await?;

  match command {
    Command::Daemon { .. } => unreachable!("handled above"),

    Command::Index { roots, exclude } => {
      let roots: Vec<String> = roots
        .into_iter()
        .map(|r| {
          std::fs::canonicalize(&r)
            .unwrap_or(r)
            .to_string_lossy()
            .into_owned()
        })
        .collect();
      client
        .call(
          Method::WatchStart,
          WatchStartParams {
            roots: roots.clone(),
            options: WatchOptions {
              include: Vec::new(),
              exclude,
            },
          },
        )
        .await?;
      println!("watching {}", roots.join(", "));
      Ok(())
    }

    Command::Search { query, k } => {
      let result = client.call(Method::Search, SearchParams { q: query, k }).await?;
      let hits: Vec<ipc::SearchHit> = serde_json::from_value(result)?;
      if hits.is_empty() {
        println!("no results");
        return Ok(());
      }
      for (rank, hit) in hits.iter().enumerate() {
        println!("{:2}. {:.3}  {} (page {}, offset {})", rank + 1, hit.score, hit.path, hit.page, hit.offset);
        let preview: String = hit.text.chars().take(160).collect();
        println!("      {}", preview.replace('\n', " "));
      }
      Ok(())
    }

    Command::Status => {
      let diagnostics = client.call(Method::GetDiagnostics, serde_json::json!({})).await?;
      let progress = client.call(Method::Progress, serde_json::json!({})).await?;
      println!("state:    {}", diagnostics["state"].as_str().unwrap_or("?"));
      println!("workers:  {}", diagnostics["workers_alive"]);
      println!(
        "files:    {} queued, {} processing, {} done, {} errors{}",
        progress["queued"],
        progress["processing"],
        progress["done"],
        progress["errors"],
        if progress["paused"].as_bool().unwrap_or(false) {
          " (paused)"
        } else {
          ""
        }
      );
      Ok(())
    }

    Command::Stats => {
      let stats = client.call(Method::Stats, serde_json::json!({})).await?;
      println!(
        "{} chunks across {} files",
        stats["total_chunks"], stats["indexed_files"]
      );
      if let Some(folders) = stats["folder_stats"].as_array() {
        for folder in folders {
          println!(
            "  {}: {} files, {} chunks",
            folder["path"].as_str().unwrap_or("?"),
            folder["indexed_files"],
            folder["total_chunks"]
          );
        }
      }
      Ok(())
    }

    Command::Folders => {
      let result = client.call(Method::GetWatchedFolders, serde_json::json!({})).await?;
      if let Some(folders) = result["folders"].as_array() {
        for folder in folders {
          println!("{}", folder.as_str().unwrap_or("?"));
        }
      }
      Ok(())
    }

    Command::Enqueue { paths } => {
      let paths: Vec<String> = paths
        .into_iter()
        .map(|p| {
          std::fs::canonicalize(&p)
            .unwrap_or(p)
            .to_string_lossy()
            .into_owned()
        })
        .collect();
      let result = client.call(Method::Enqueue, EnqueueParams { paths }).await?;
      println!("queued {}", result["queued"]);
      Ok(())
    }

    Command::Pause => {
      client.call(Method::Pause, serde_json::json!({})).await?;
      println!("paused");
      Ok(())
    }

    Command::Resume => {
      client.call(Method::Resume, serde_json::json!({})).await?;
      println!("resumed");
      Ok(())
    }

    Command::ReindexAll => {
      client
        .call_with_progress(Method::ReindexAll, serde_json::json!({}), print_progress)
        .await?;
      println!("re-indexing started");
      Ok(())
    }

    Command::Shutdown => {
      let report = client.call(Method::Shutdown, serde_json::json!({})).await?;
      if let Some(steps) = report["steps"].as_array() {
        for step in steps {
          let mark = if step["ok"].as_bool().unwrap_or(false) { "ok" } else { "FAILED" };
          let timed_out = step["timed_out"].as_bool().unwrap_or(false);
          println!(
            "{:24} {}{}",
            step["name"].as_str().unwrap_or("?"),
            mark,
            if timed_out { " (timed out)" } else { "" }
          );
        }
      }
      Ok(())
    }
  }
}

fn print_progress(event: ProgressEvent) {
  if let ProgressEvent::Indexing {
    queued,
    processing,
    done,
    errors,
    ..
  } = event
  {
    eprintln!("{queued} queued, {processing} processing, {done} done, {errors} errors");
  }
}
