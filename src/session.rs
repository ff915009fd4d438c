//! Per-connection SSH handler.
//!
//! Every authenticated connection gets one [`ConnectionHandler`]. It accepts
//! `session` channels and lets each of them run exactly one thing: a Git
//! command through the `serv` subprocess, or the "no shell access" banner.
//!
//! Flow for `git clone ssh://git@host/owner/repo.git`:
//! 1. Client connects and a new `ConnectionHandler` is created.
//! 2. `auth_publickey` resolves the key to a key id.
//! 3. `channel_open_session`
//! 4. optionally `env_request` (e.g. `GIT_PROTOCOL`), which we refuse.
//! 5. `exec_request` with `git-upload-pack 'owner/repo.git'`, which spawns
//!    `<self> serv key-<id> --config=<path>` and bridges its stdio.
//! 6. `data` / `channel_eof` feed the subprocess stdin until the client is
//!    done; once the subprocess exits we send `exit-status` and close.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::auth::{AuthError, Authenticator, KeyId};
use crate::command;
use crate::config::Settings;

/// SSH extended data type for stderr (RFC 4254 section 5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

/// Client data chunks queued for a subprocess that is not reading its stdin.
/// Once full, `data` waits, russh stops reading the socket and the client runs
/// out of window.
const STDIN_QUEUE: usize = 16;

/// Most stderr we hold back while stdout is still draining. The rest is read
/// and discarded.
const STDERR_LIMIT: u64 = 4 * 1024 * 1024;

/// Aborts a bridge task when the channel state owning it goes away.
struct AbortOnDrop(tokio::task::AbortHandle);

impl AbortOnDrop {
  fn new<T>(task: &tokio::task::JoinHandle<T>) -> Self {
    Self(task.abort_handle())
  }
}

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    self.0.abort();
  }
}

/// What a session channel is currently doing. Requests are only acted on in
/// `Open`; `exec` and `shell` are both terminal.
enum ChannelState {
  Open,

  /// A `serv` subprocess owns the channel.
  ///
  /// Dropping this state aborts the output bridge, which owns the
  /// `tokio::process::Child`. The child has `kill_on_drop(true)`, so closing
  /// the channel or losing the connection never leaks a process.
  Running {
    /// Feeds the stdin bridge. `None` once the client sent EOF.
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    _output_bridge: AbortOnDrop,
  },

  /// `exec` or `shell` was handled and the channel is being closed.
  Done,
}

/// Only `session` channels are accepted. Other channel types get russh's
/// default refusal, which carries `ADMINISTRATIVELY_PROHIBITED`.
pub struct ConnectionHandler {
  tracing_span: tracing::Span,

  settings: Arc<Settings>,
  authenticator: Authenticator,

  /// Set by a successful `auth_publickey`, shared by every channel of the
  /// connection.
  key_id: Option<KeyId>,

  channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
  pub fn new(settings: Arc<Settings>, authenticator: Authenticator, client_address: SocketAddr) -> Self {
    let client_id = Uuid::new_v4();
    Self {
      tracing_span: tracing::info_span!("connection", %client_id, %client_address),
      settings,
      authenticator,
      key_id: None,
      channels: HashMap::new(),
    }
  }

  pub fn span(&self) -> &tracing::Span {
    &self.tracing_span
  }

  /// Move `channel` from `Open` to `Done`. Returns false, leaving the state
  /// alone, if the channel was not open.
  fn claim(&mut self, channel_id: ChannelId) -> bool {
    match self.channels.get_mut(&channel_id) {
      Some(state) if matches!(state, ChannelState::Open) => {
        *state = ChannelState::Done;
        true
      }
      _ => false,
    }
  }

  fn shell_banner(&self) -> String {
    let app_name = &self.settings.app_name;
    format!(
      "Hi there, You've successfully authenticated, but {app_name} does not provide shell access.\n\
       If this is unexpected, please log in with password and setup {app_name} under another user.\n"
    )
  }

  /// Start `<self> serv key-<id> --config=<path>` for `command`.
  fn spawn_serv(&self, key_id: KeyId, command: &OsStr) -> anyhow::Result<ServProcess> {
    let mut config_arg = OsString::from("--config=");
    config_arg.push(&self.settings.custom_conf);

    // The environment is inherited; the subprocess is our own binary.
    let mut child = tokio::process::Command::new(&self.settings.app_path)
      .arg("serv")
      .arg(format!("key-{key_id}"))
      .arg(config_arg)
      .env("SSH_ORIGINAL_COMMAND", command)
      .env("SKIP_MINWINSVC", "1")
      .kill_on_drop(true)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .with_context(|| format!("failed to start {:?}", self.settings.app_path))?;
    tracing::debug!(pid = child.id(), "serv spawned");

    let stdin = child.stdin.take().context("failed to get stdin for serv")?;
    let stdout = child.stdout.take().context("failed to get stdout for serv")?;
    let stderr = child.stderr.take().context("failed to get stderr for serv")?;
    Ok(ServProcess {
      child,
      stdin,
      stdout,
      stderr,
    })
  }
}

struct ServProcess {
  child: Child,
  stdin: ChildStdin,
  stdout: ChildStdout,
  stderr: ChildStderr,
}

/// Exit code reported to the client. Death by signal N is reported as 128+N,
/// like a shell would.
pub(crate) fn exit_code(status: &ExitStatus) -> u32 {
  match (status.code(), status.signal()) {
    (Some(code), _) => code.try_into().unwrap_or(1),
    (None, Some(signal)) => signal as u32 + 128,
    (None, None) => 1,
  }
}

/// Send exit-status (if any), EOF and close, in that order.
async fn close_channel(handle: &Handle, channel_id: ChannelId, exit_status: Option<u32>) {
  if let Some(exit_status) = exit_status {
    if let Err(error) = handle.exit_status_request(channel_id, exit_status).await {
      tracing::error!(?error, "sending exit status failed");
    }
  }
  if let Err(error) = handle.eof(channel_id).await {
    tracing::error!(?error, "sending eof failed");
  }
  if let Err(error) = handle.close(channel_id).await {
    tracing::error!(?error, "sending close failed");
  }
}

/// Same as [`close_channel`] but from inside a handler callback, queued behind
/// whatever the callback already wrote.
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
  session.exit_status_request(channel_id, exit_status);
  session.eof(channel_id);
  session.close(channel_id);
}

/// Copy `reader` to the channel until EOF, as stdout or as extended data.
async fn pipe_to_channel<R>(
  handle: &Handle,
  channel_id: ChannelId,
  extended: Option<u32>,
  mut reader: R,
) -> anyhow::Result<u64>
where
  R: AsyncRead + Unpin,
{
  let mut buffer = vec![0; 32 * 1024];
  let mut total = 0u64;
  loop {
    let n = reader.read(&mut buffer).await.context("reading from serv failed")?;
    if n == 0 {
      return Ok(total);
    }
    let data = CryptoVec::from_slice(&buffer[..n]);
    let sent = match extended {
      Some(ext) => handle.extended_data(channel_id, ext, data).await,
      None => handle.data(channel_id, data).await,
    };
    if sent.is_err() {
      anyhow::bail!("channel closed while sending data");
    }
    total += n as u64;
  }
}

/// Forward client data to the subprocess. Ends when the sender is dropped,
/// i.e. on client EOF or when the channel goes away, and closes the child's
/// stdin on the way out.
async fn bridge_stdin(mut data: mpsc::Receiver<Vec<u8>>, mut stdin: ChildStdin) {
  while let Some(chunk) = data.recv().await {
    if let Err(error) = stdin.write_all(&chunk).await {
      tracing::warn!(%error, "writing to serv stdin failed");
      return;
    }
  }
}

/// Drain stdout to the channel, then stderr to the channel's stderr stream,
/// then wait for the subprocess and report its exit code.
///
/// stderr is collected while stdout is being copied so a subprocess that
/// writes a lot of diagnostics cannot block on a full pipe.
async fn bridge_output(
  handle: Handle,
  channel_id: ChannelId,
  mut child: Child,
  stdout: ChildStdout,
  mut stderr: ChildStderr,
) {
  let (stdout_result, stderr_result) = tokio::join!(
    pipe_to_channel(&handle, channel_id, None, stdout),
    read_capped(&mut stderr, STDERR_LIMIT),
  );
  match stdout_result {
    Ok(bytes) => tracing::debug!(bytes, "serv stdout drained"),
    Err(error) => tracing::error!(?error, "copying serv stdout failed"),
  }
  let stderr_buf = match stderr_result {
    Ok((buf, 0)) => buf,
    Ok((buf, discarded)) => {
      tracing::warn!(kept = buf.len(), discarded, "serv stderr truncated");
      buf
    }
    Err(error) => {
      tracing::error!(%error, "reading serv stderr failed");
      Vec::new()
    }
  };
  if !stderr_buf.is_empty() {
    if let Err(error) = pipe_to_channel(&handle, channel_id, Some(EXTENDED_DATA_STDERR), &stderr_buf[..]).await {
      tracing::error!(?error, "copying serv stderr failed");
    }
  }

  match child.wait().await {
    Ok(status) => {
      tracing::info!(%status, "serv finished");
      close_channel(&handle, channel_id, Some(exit_code(&status))).await;
    }
    Err(error) => {
      tracing::error!(%error, "waiting for serv failed");
      close_channel(&handle, channel_id, None).await;
    }
  }
}

/// Read `reader` to EOF, keeping the first `limit` bytes. Returns them and the
/// number of bytes dropped after that.
async fn read_capped<R>(reader: &mut R, limit: u64) -> std::io::Result<(Vec<u8>, u64)>
where
  R: AsyncRead + Unpin,
{
  let mut kept = Vec::new();
  (&mut *reader).take(limit).read_to_end(&mut kept).await?;
  let discarded = tokio::io::copy(reader, &mut tokio::io::sink()).await?;
  Ok((kept, discarded))
}

#[async_trait]
impl russh::server::Handler for ConnectionHandler {
  type Error = anyhow::Error;

  // `public_key` Debug prints in a format that is basically worthless.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, public_key))]
  async fn auth_publickey(&mut self, user: &str, public_key: &russh_keys::key::PublicKey) -> Result<Auth, Self::Error> {
    match self.authenticator.authenticate(user, public_key).await {
      Ok(key_id) => {
        tracing::info!(%key_id, "public key accepted");
        self.key_id = Some(key_id);
        Ok(Auth::Accept)
      }
      Err(error) => {
        match &error {
          AuthError::UnknownKey(source) => tracing::error!(%error, %source, "public key lookup failed"),
          _ => tracing::warn!(%error, "public key rejected"),
        }
        Ok(Auth::Reject {
          proceed_with_methods: None,
        })
      }
    }
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, channel, _session), fields(channel_id = %channel.id()))]
  async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
    // We never read from `channel` itself; requests and data arrive through
    // the handler callbacks.
    self.channels.insert(channel.id(), ChannelState::Open);
    Ok(true)
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn env_request(
    &mut self,
    channel_id: ChannelId,
    variable_name: &str,
    variable_value: &str,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    tracing::debug!("refusing env request");
    session.channel_failure(channel_id);
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    if !self.claim(channel_id) {
      session.channel_failure(channel_id);
      return Ok(());
    }
    session.channel_success(channel_id);
    session.data(channel_id, CryptoVec::from_slice(self.shell_banner().as_bytes()));
    finish_channel(session, channel_id, 0);
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, data, session))]
  async fn exec_request(&mut self, channel_id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
    if !self.claim(channel_id) {
      session.channel_failure(channel_id);
      return Ok(());
    }

    let command = match command::sanitize(data) {
      Ok(command) => command,
      Err(error) => {
        tracing::warn!(command = error.command(), %error, "invalid exec command");
        let message = format!(
          "{}: invalid command: {:?}: {}\n",
          self.settings.app_name,
          error.command(),
          error
        );
        session.channel_success(channel_id);
        session.data(channel_id, CryptoVec::from_slice(message.as_bytes()));
        finish_channel(session, channel_id, 1);
        return Ok(());
      }
    };
    tracing::info!(command = %command.to_string_lossy(), "exec");

    let key_id = self.key_id.context("exec request on an unauthenticated connection")?;
    let ServProcess {
      child,
      stdin,
      stdout,
      stderr,
    } = match self.spawn_serv(key_id, &command) {
      Ok(process) => process,
      Err(error) => {
        // No reply; the client just sees the channel go away.
        tracing::error!(?error, "failed to start serv");
        session.close(channel_id);
        return Ok(());
      }
    };

    // The reply must go out before any subprocess output does. Both bridges
    // talk through `Handle`, whose messages are processed after this
    // callback returns.
    session.channel_success(channel_id);

    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    tokio::spawn(bridge_stdin(stdin_rx, stdin).instrument(tracing::Span::current()));
    let output_bridge = tokio::spawn(
      bridge_output(session.handle(), channel_id, child, stdout, stderr).instrument(tracing::Span::current()),
    );

    self.channels.insert(
      channel_id,
      ChannelState::Running {
        stdin: Some(stdin_tx),
        _output_bridge: AbortOnDrop::new(&output_bridge),
      },
    );
    Ok(())
  }

  /// SSH client sends data, hand it to the stdin bridge. Waits while the
  /// queue is full, which stops russh from reading more from the client.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, data, _session), level = "trace", fields(len = data.len()))]
  async fn data(&mut self, channel_id: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
    match self.channels.get_mut(&channel_id) {
      Some(ChannelState::Running { stdin, .. }) => {
        if let Some(sender) = stdin {
          if sender.send(data.to_vec()).await.is_err() {
            // The stdin bridge gave up; the rest of the input goes nowhere.
            *stdin = None;
          }
        }
      }
      _ => tracing::trace!("dropping data for a channel without a subprocess"),
    }
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_eof(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    if let Some(ChannelState::Running { stdin, .. }) = self.channels.get_mut(&channel_id) {
      // Dropping the sender ends the stdin bridge, which closes the pipe.
      *stdin = None;
    }
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    drop(self.channels.remove(&channel_id));
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _modes, session))]
  async fn pty_request(
    &mut self,
    channel_id: ChannelId,
    term: &str,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    _modes: &[(russh::Pty, u32)],
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    tracing::trace!("rejecting pty request");
    session.channel_failure(channel_id);
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, x11_auth_cookie, session))]
  async fn x11_request(
    &mut self,
    channel_id: ChannelId,
    single_connection: bool,
    x11_auth_protocol: &str,
    x11_auth_cookie: &str,
    x11_screen_number: u32,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    tracing::trace!("rejecting x11 request");
    session.channel_failure(channel_id);
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn subsystem_request(
    &mut self,
    channel_id: ChannelId,
    name: &str,
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    tracing::trace!("rejecting subsystem request");
    session.channel_failure(channel_id);
    Ok(())
  }
}
