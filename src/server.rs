//! Server assembly and the TCP accept loop.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use russh::MethodSet;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::auth::{Authenticator, KeyRegistry};
use crate::config::{Settings, SshSettings};
use crate::host_keys::HostKeys;
use crate::session::ConnectionHandler;

/// A configured, not yet listening, SSH server.
pub struct SshServer {
  settings: Arc<Settings>,
  authenticator: Authenticator,
  config: Arc<russh::server::Config>,
}

impl SshServer {
  /// Load (or create) the host keys under the data directory and build the
  /// server configuration.
  pub fn new(settings: Arc<Settings>, registry: Arc<dyn KeyRegistry>) -> anyhow::Result<Self> {
    let ssh_dir = settings.ssh_dir();
    let host_keys = HostKeys::bootstrap(&ssh_dir).with_context(|| format!("no usable host key in {ssh_dir:?}"))?;
    tracing::info!(paths = ?host_keys.paths, "host keys loaded");
    Ok(Self::with_host_keys(settings, registry, host_keys))
  }

  pub fn with_host_keys(settings: Arc<Settings>, registry: Arc<dyn KeyRegistry>, host_keys: HostKeys) -> Self {
    let config = server_config(&settings.ssh, host_keys);
    let authenticator = Authenticator::new(settings.ssh.builtin_server_user.clone(), registry);
    Self {
      settings,
      authenticator,
      config: Arc::new(config),
    }
  }

  /// Bind the configured address and accept connections in the background.
  /// Returns the bound address and the accept loop's task.
  pub async fn start(self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let addr = self.settings.listen_addr();
    let listener = TcpListener::bind(&addr)
      .await
      .with_context(|| format!("failed to start SSH server on {addr}"))?;
    let local_addr = listener.local_addr().context("failed to read bound address")?;
    tracing::info!(%local_addr, "SSH server listening");
    Ok((local_addr, tokio::spawn(self.serve(listener))))
  }

  /// Accept connections on `listener` forever. Each connection is handshaken
  /// and served in its own task, so a client that stalls mid-handshake holds
  /// up nobody else.
  pub async fn serve(self, listener: TcpListener) {
    loop {
      let (socket, client_address) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(error) => {
          tracing::error!(%error, "error accepting incoming connection");
          continue;
        }
      };

      let handler = ConnectionHandler::new(self.settings.clone(), self.authenticator.clone(), client_address);
      let span = handler.span().clone();
      let config = self.config.clone();
      tokio::spawn(
        async move {
          tracing::trace!("handshaking");
          let session = match russh::server::run_stream(config, socket, handler).await {
            Ok(session) => session,
            Err(error) => return log_session_error(&error),
          };
          match session.await {
            Ok(()) => tracing::debug!("connection closed"),
            Err(error) => log_session_error(&error),
          }
        }
        .instrument(span),
      );
    }
  }
}

/// A client hanging up is routine; anything else is worth an error.
fn log_session_error(error: &anyhow::Error) {
  if is_hangup(error) {
    tracing::warn!(%error, "connection terminated by client");
  } else {
    tracing::error!(?error, "connection failed");
  }
}

fn is_hangup(error: &anyhow::Error) -> bool {
  error.chain().any(|cause| {
    let io = match cause.downcast_ref::<russh::Error>() {
      Some(russh::Error::Disconnect) => return true,
      Some(russh::Error::IO(io)) => Some(io),
      _ => cause.downcast_ref::<std::io::Error>(),
    };
    io.is_some_and(|io| {
      matches!(
        io.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
      )
    })
  })
}

fn server_config(ssh: &SshSettings, host_keys: HostKeys) -> russh::server::Config {
  let mut preferred = russh::Preferred::default();
  if let Some(kex) = allow_list::<russh::kex::Name>("key exchange", &ssh.key_exchanges) {
    preferred.kex = Cow::Owned(kex);
  }
  if let Some(cipher) = allow_list::<russh::cipher::Name>("cipher", &ssh.ciphers) {
    preferred.cipher = Cow::Owned(cipher);
  }
  if let Some(mac) = allow_list::<russh::mac::Name>("MAC", &ssh.macs) {
    preferred.mac = Cow::Owned(mac);
  }

  russh::server::Config {
    methods: MethodSet::PUBLICKEY,
    keys: host_keys.keys,
    preferred,
    auth_rejection_time: Duration::from_secs(1),
    auth_rejection_time_initial: Some(Duration::from_secs(0)),
    inactivity_timeout: (ssh.inactivity_timeout_secs > 0).then(|| Duration::from_secs(ssh.inactivity_timeout_secs)),
    ..Default::default()
  }
}

/// Map configured algorithm names onto what russh implements. Unknown names
/// are skipped; `None` means "use the library defaults".
fn allow_list<N>(kind: &str, names: &[String]) -> Option<Vec<N>>
where
  N: for<'a> TryFrom<&'a str>,
{
  let supported: Vec<N> = names
    .iter()
    .filter_map(|name| match N::try_from(name.as_str()) {
      Ok(algorithm) => Some(algorithm),
      Err(_) => {
        tracing::warn!(kind, %name, "unsupported algorithm, ignoring");
        None
      }
    })
    .collect();
  if supported.is_empty() {
    if !names.is_empty() {
      tracing::warn!(kind, "no supported algorithm configured, using defaults");
    }
    return None;
  }
  Some(supported)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn empty_allow_list_keeps_defaults() {
    assert!(allow_list::<russh::cipher::Name>("cipher", &[]).is_none());
  }

  #[test]
  fn unknown_algorithms_are_skipped() {
    let ciphers = allow_list::<russh::cipher::Name>("cipher", &names(&["arcfour", "aes128-ctr"])).unwrap();
    assert_eq!(ciphers, vec![russh::cipher::AES_128_CTR]);

    let kex = allow_list::<russh::kex::Name>("key exchange", &names(&["curve25519-sha256"])).unwrap();
    assert_eq!(kex, vec![russh::kex::CURVE25519]);

    assert!(allow_list::<russh::mac::Name>("MAC", &names(&["hmac-md5"])).is_none());
  }

  #[test]
  fn config_is_public_key_only() {
    let ssh = SshSettings {
      ciphers: names(&["aes256-ctr", "aes128-ctr"]),
      inactivity_timeout_secs: 30,
      ..SshSettings::default()
    };
    let host_keys = HostKeys {
      paths: Vec::new(),
      keys: vec![russh_keys::key::KeyPair::generate_ed25519()],
    };
    let config = server_config(&ssh, host_keys);
    assert_eq!(config.methods, MethodSet::PUBLICKEY);
    assert_eq!(config.keys.len(), 1);
    assert_eq!(&config.preferred.cipher[..], &[russh::cipher::AES_256_CTR, russh::cipher::AES_128_CTR]);
    assert_eq!(config.preferred.kex, russh::Preferred::default().kex);
    assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(30)));
  }

  #[test]
  fn hangups_are_recognised() {
    let eof = anyhow::Error::from(russh::Error::IO(std::io::ErrorKind::UnexpectedEof.into()));
    assert!(is_hangup(&eof));
    assert!(is_hangup(&anyhow::Error::from(russh::Error::Disconnect)));
    assert!(is_hangup(&anyhow::Error::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).context("handshake")));
    assert!(!is_hangup(&anyhow::anyhow!("bad signature")));
  }
}
