//! A client for the daemon RPC bus (component N): connects to a running
//! daemon's Unix socket and exchanges newline-delimited JSON requests and
//! responses, matched by request id.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::time;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::rpc::{Result, RpcError};
use crate::rpc::protocol::{Frame, Request, RequestBody, Response};

/// A connected client, good for one request at a time. Unsolicited
/// [`Event`](crate::rpc::protocol::Event) frames received while waiting for a
/// response are silently dropped; a caller that needs events should read them
/// separately via [`Client::next_event`].
pub struct Client {
  framed: Framed<UnixStream, LinesCodec>,
  next_id: AtomicU64,
  request_timeout: Duration,
}

impl Client {
  /// Connects to a daemon already listening on `socket_path`.
  pub async fn connect(socket_path: impl AsRef<Path>, request_timeout: Duration) -> Result<Self> {
    let stream = UnixStream::connect(socket_path.as_ref()).await?;
    Ok(Self {
      framed: Framed::new(stream, LinesCodec::new()),
      next_id: AtomicU64::new(1),
      request_timeout,
    })
  }

  /// Sends a request and awaits the matching response, bounded by the
  /// client's configured request timeout.
  pub async fn request(&mut self, body: RequestBody) -> Result<Response> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
    let kind = body.type_name();
    let request = Request { id: id.clone(), body };
    let line = serde_json::to_string(&Frame::Request(request))?;
    self
      .framed
      .send(line)
      .await
      .map_err(|e| RpcError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;

    time::timeout(self.request_timeout, self.wait_for_response(&id, kind))
      .await
      .map_err(|_| RpcError::RequestTimeout)?
  }

  async fn wait_for_response(&mut self, id: &str, kind: &'static str) -> Result<Response> {
    loop {
      let line = self
        .framed
        .next()
        .await
        .ok_or(RpcError::DaemonUnreachable)?
        .map_err(|e| RpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
      match serde_json::from_str::<Frame>(&line)? {
        Frame::Response(response) if response.id == id => return Ok(response),
        Frame::Response(_) | Frame::Event(_) | Frame::Request(_) => {
          log::trace!("rpc client discarding frame not matching request {id} ({kind})");
        }
      }
    }
  }

  /// Sends a bare `ping` and returns whether the daemon answered at all.
  pub async fn ping(&mut self) -> bool {
    matches!(self.request(RequestBody::Ping).await, Ok(response) if response.success)
  }

  /// Reads the next frame off the wire without matching it to a pending
  /// request, for callers that only care about the event stream.
  pub async fn next_event(&mut self) -> Result<Option<Frame>> {
    match self.framed.next().await {
      Some(line) => {
        let line = line.map_err(|e| RpcError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(Some(serde_json::from_str(&line)?))
      }
      None => Ok(None),
    }
  }
}

/// Connects to a daemon already listening at `socket_path`, retrying with a
/// short capped backoff, useful right after spawning a fresh daemon process
/// while it is still initializing.
pub async fn connect_with_retry(
  socket_path: impl AsRef<Path>,
  request_timeout: Duration,
  max_wait: Duration,
) -> Result<Client> {
  let deadline = time::Instant::now() + max_wait;
  let mut delay = Duration::from_millis(50);

  loop {
    match Client::connect(socket_path.as_ref(), request_timeout).await {
      Ok(client) => return Ok(client),
      Err(e) if time::Instant::now() < deadline => {
        log::debug!("daemon not yet reachable ({e}), retrying in {delay:?}");
        time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(1));
      }
      Err(e) => return Err(e),
    }
  }
}

/// The manager-layer entry point a CLI uses to reach a daemon: probe the
/// socket with a `ping`, and if nothing answers, spawn `daemon_binary`
/// detached and wait up to ten seconds for it to become reachable.
pub async fn connect_or_spawn(
  socket_path: impl AsRef<Path>,
  request_timeout: Duration,
  daemon_binary: impl AsRef<Path>,
) -> Result<Client> {
  let socket_path = socket_path.as_ref();

  if let Ok(mut client) = Client::connect(socket_path, request_timeout).await {
    if client.ping().await {
      return Ok(client);
    }
  }

  log::info!("no daemon answering at {}, spawning {}", socket_path.display(), daemon_binary.as_ref().display());
  spawn_detached(daemon_binary.as_ref())?;

  connect_with_retry(socket_path, request_timeout, Duration::from_secs(10)).await
}

#[cfg(unix)]
fn spawn_detached(daemon_binary: &Path) -> Result<()> {
  use std::os::unix::process::CommandExt;

  std::process::Command::new(daemon_binary)
    .stdin(std::process::Stdio::null())
    .stdout(std::process::Stdio::null())
    .stderr(std::process::Stdio::null())
    .process_group(0)
    .spawn()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use tokio::net::UnixListener;

  use crate::rpc::protocol::Response;

  use super::*;

  /// Accepts a single connection and answers every request with a bare
  /// success response echoing the request's id and type.
  async fn fake_daemon(listener: UnixListener) {
    let (stream, _addr) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());
    while let Some(Ok(line)) = framed.next().await {
      let Frame::Request(request) = serde_json::from_str::<Frame>(&line).unwrap() else { continue };
      let response = Response::ok(request.id, request.body.type_name(), serde_json::json!({}));
      let line = serde_json::to_string(&Frame::Response(response)).unwrap();
      if framed.send(line).await.is_err() {
        break;
      }
    }
  }

  #[tokio::test]
  async fn request_matches_the_response_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("fileswarm.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    tokio::spawn(fake_daemon(listener));

    let mut client = Client::connect(&socket_path, Duration::from_secs(1)).await.unwrap();
    let response = client.request(RequestBody::Ping).await.unwrap();
    assert!(response.success);
    assert_eq!(response.kind, "ping");
  }

  #[tokio::test]
  async fn ping_reports_true_when_a_daemon_answers() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("fileswarm.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    tokio::spawn(fake_daemon(listener));

    let mut client = Client::connect(&socket_path, Duration::from_secs(1)).await.unwrap();
    assert!(client.ping().await);
  }

  #[tokio::test]
  async fn connect_fails_when_nothing_is_listening() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("nobody-home.sock");
    assert!(Client::connect(&socket_path, Duration::from_secs(1)).await.is_err());
  }
}
