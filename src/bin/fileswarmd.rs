//! Daemon entry point: initializes logging, builds the engine's
//! configuration, and runs the RPC bus until a `shutdown` request arrives.
//!
//! Argument parsing and config-file loading are out of scope here (that's
//! left to whatever wraps this binary); the only external input accepted is
//! the `FILESWARM_DOWNLOAD_DIR` environment variable.

use std::path::{Path, PathBuf};

use fileswarm::conf::Conf;
use fileswarm::rpc::daemon;

#[tokio::main]
async fn main() {
  let download_dir = std::env::var_os("FILESWARM_DOWNLOAD_DIR")
    .map(PathBuf::from)
    .unwrap_or_else(default_download_dir);

  let conf = Conf::new(download_dir);
  init_logging(&conf.rpc.log_file);

  if let Err(e) = std::fs::create_dir_all(&conf.engine.download_dir) {
    log::error!("failed to create download directory {}: {e}", conf.engine.download_dir.display());
    std::process::exit(1);
  }

  if let Err(e) = daemon::run(conf).await {
    log::error!("daemon exited with an error: {e}");
    std::process::exit(1);
  }
}

fn default_download_dir() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."))
    .join("Downloads")
    .join("fileswarm")
}

/// Logs go to `log_file`; falls back to stderr if it can't be opened.
fn init_logging(log_file: &Path) {
  if let Some(parent) = log_file.parent() {
    let _ = std::fs::create_dir_all(parent);
  }

  let target = std::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(log_file)
    .map(|file| env_logger::Target::Pipe(Box::new(file)))
    .unwrap_or(env_logger::Target::Stderr);

  env_logger::Builder::from_default_env().target(target).init();
}
