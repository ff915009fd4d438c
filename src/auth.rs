use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use crate::codec;

/// Application-level identifier of a registered public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(pub i64);

impl fmt::Display for KeyId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The application's public key store. Only the one query the SSH front-end
/// needs is exposed here.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
  /// Look up the key whose `authorized_keys` line (`<algorithm> <base64>`) is
  /// `content`, returning its id.
  async fn search_public_key_by_content(&self, content: &str) -> anyhow::Result<i64>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
  #[error("username {user:?} doesn't match configured built-in SSH username {expected:?}")]
  WrongUser { user: String, expected: String },
  #[error("public key is not registered")]
  UnknownKey(#[source] anyhow::Error),
  #[error("failed to encode offered public key")]
  BadKey(#[source] anyhow::Error),
}

/// Render `key` as a single `authorized_keys` line without a comment.
///
/// The algorithm is taken from the type string inside the key blob rather
/// than from `PublicKey::name`, which reports the negotiated signature hash
/// for RSA keys (`rsa-sha2-256`) instead of the key type (`ssh-rsa`).
pub fn authorized_key_line(key: &PublicKey) -> anyhow::Result<String> {
  let blob_base64 = key.public_key_base64();
  let blob = base64::engine::general_purpose::STANDARD
    .decode(blob_base64.as_bytes())
    .context("public key blob is not valid base64")?;
  let (algorithm, _) = codec::parse_string(&blob).context("public key blob has no type string")?;
  let algorithm = std::str::from_utf8(algorithm).context("public key type is not UTF-8")?;
  Ok(format!("{algorithm} {blob_base64}"))
}

/// Decides whether a connection may proceed and under which key id.
#[derive(Clone)]
pub struct Authenticator {
  builtin_server_user: String,
  registry: Arc<dyn KeyRegistry>,
}

impl Authenticator {
  /// An empty `builtin_server_user` accepts any username.
  pub fn new(builtin_server_user: impl Into<String>, registry: Arc<dyn KeyRegistry>) -> Self {
    Self {
      builtin_server_user: builtin_server_user.into(),
      registry,
    }
  }

  pub async fn authenticate(&self, user: &str, key: &PublicKey) -> Result<KeyId, AuthError> {
    if !self.builtin_server_user.is_empty() && user != self.builtin_server_user {
      return Err(AuthError::WrongUser {
        user: user.to_owned(),
        expected: self.builtin_server_user.clone(),
      });
    }

    let content = authorized_key_line(key).map_err(AuthError::BadKey)?;
    let id = self
      .registry
      .search_public_key_by_content(content.trim())
      .await
      .map_err(AuthError::UnknownKey)?;
    Ok(KeyId(id))
  }
}
