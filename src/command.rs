//! Whitelisting for `exec` requests.
//!
//! OpenSSH clients send the remote command the way a shell would see it, e.g.
//! `git-upload-pack 'owner/repo.git'`, and some wrappers add extra quoting or
//! a subshell around it. We only ever run Git commands, so everything before
//! the first `git` is discarded along with any leading `'`, `(` or `)`. The
//! result is never handed to a shell.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::codec::{self, MalformedPayload};

const WRAPPER_BYTES: &[u8] = b"'()";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
  #[error(transparent)]
  Malformed(#[from] MalformedPayload),

  /// `command` is the client's string, kept for the diagnostic we send back.
  /// Bytes that are not UTF-8 are replaced here, never in what we forward.
  #[error("only git commands are supported")]
  Unsupported { command: String },
}

impl CommandError {
  /// The command as the client sent it, empty if the payload could not be
  /// decoded.
  pub fn command(&self) -> &str {
    match self {
      CommandError::Malformed(_) => "",
      CommandError::Unsupported { command } => command,
    }
  }
}

/// Decode the single SSH string of an `exec` payload (RFC 4254 section 6.5)
/// and sanitize it.
pub fn clean_command(payload: &[u8]) -> Result<OsString, CommandError> {
  let (command, _) = codec::parse_string(payload)?;
  sanitize(command)
}

/// Sanitize an already unframed `exec` command. The bytes are kept as sent;
/// the result goes into the subprocess environment as is.
pub fn sanitize(command: &[u8]) -> Result<OsString, CommandError> {
  let start = command
    .windows(3)
    .position(|w| w == b"git")
    .ok_or_else(|| CommandError::Unsupported {
      command: String::from_utf8_lossy(command).into_owned(),
    })?;
  let rest = &command[start..];
  let skip = rest.iter().take_while(|&&b| WRAPPER_BYTES.contains(&b)).count();
  Ok(OsString::from_vec(rest[skip..].to_vec()))
}
