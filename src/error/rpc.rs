//! Errors produced by the daemon RPC transport (component N).

pub type Result<T, E = RpcError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
  #[error("daemon is unreachable")]
  DaemonUnreachable,

  #[error("request timed out waiting for a response")]
  RequestTimeout,

  #[error("{0}")]
  Io(std::io::Error),

  #[error("malformed request/response frame: {0}")]
  Codec(serde_json::Error),

  #[error("the request channel has been closed")]
  Channel,
}

impl From<std::io::Error> for RpcError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for RpcError {
  fn from(value: serde_json::Error) -> Self {
    Self::Codec(value)
  }
}
