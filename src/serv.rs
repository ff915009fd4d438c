//! `serv`: the subprocess side of an SSH `exec`.
//!
//! The SSH server starts `<self> serv key-<id> --config=<path>` with the
//! sanitized client command in `SSH_ORIGINAL_COMMAND`. This resolves the
//! repository, checks the key may use it, and hands the connection over to
//! `git` with our stdio. Anything written to stderr ends up on the Git
//! client's terminal.

use std::path::{Path, PathBuf};

use crate::config::{PublicKeyRecord, Settings};
use crate::registry::ConfigKeyRegistry;
use crate::session::exit_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
  UploadPack,
  UploadArchive,
  ReceivePack,
}

impl Verb {
  const ALL: [Verb; 3] = [Verb::UploadPack, Verb::UploadArchive, Verb::ReceivePack];

  /// The `git` subcommand that serves this verb.
  pub fn git_subcommand(self) -> &'static str {
    match self {
      Verb::UploadPack => "upload-pack",
      Verb::UploadArchive => "upload-archive",
      Verb::ReceivePack => "receive-pack",
    }
  }

  pub fn is_write(self) -> bool {
    self == Verb::ReceivePack
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRequest {
  pub verb: Verb,
  pub owner: String,
  pub repo: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServError {
  #[error("no command given; this subcommand is only meant to be run by the SSH server")]
  NoCommand,
  #[error("invalid key argument {0:?}")]
  BadKeyArgument(String),
  #[error("unknown public key id {0}")]
  UnknownKey(i64),
  #[error("unknown git command {0:?}")]
  UnknownCommand(String),
  #[error("invalid repository path {0:?}")]
  InvalidRepoPath(String),
  #[error("repository does not exist or you do not have access")]
  RepoNotFound,
  #[error("user {user:?} is not allowed to push to {owner}/{repo}")]
  PushDenied { user: String, owner: String, repo: String },
  #[error("failed to execute git")]
  Spawn(#[source] std::io::Error),
}

/// Parse `key-<id>`.
pub fn parse_key_argument(arg: &str) -> Result<i64, ServError> {
  arg
    .strip_prefix("key-")
    .and_then(|id| id.parse().ok())
    .ok_or_else(|| ServError::BadKeyArgument(arg.to_owned()))
}

/// Parse `git-upload-pack 'owner/repo.git'` and its spellings
/// (`git upload-pack`, unquoted, leading `/`, missing `.git`).
pub fn parse_command(command: &str) -> Result<GitRequest, ServError> {
  let command = command.trim();
  let (verb, rest) = Verb::ALL
    .iter()
    .find_map(|&verb| {
      let sub = verb.git_subcommand();
      command
        .strip_prefix("git-")
        .or_else(|| command.strip_prefix("git "))
        .and_then(|c| c.strip_prefix(sub))
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        .map(|rest| (verb, rest))
    })
    .ok_or_else(|| ServError::UnknownCommand(command.to_owned()))?;

  let path = rest.trim().trim_matches(|c| c == '\'' || c == '"');
  let invalid = || ServError::InvalidRepoPath(path.to_owned());
  let trimmed = path.trim_start_matches('/').trim_end_matches('/');
  let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
  let (owner, repo) = trimmed.split_once('/').ok_or_else(invalid)?;
  if !is_valid_name(owner) || !is_valid_name(repo) {
    return Err(invalid());
  }

  Ok(GitRequest {
    verb,
    owner: owner.to_owned(),
    repo: repo.to_owned(),
  })
}

/// User and repository names: no path separators, no leading dot.
fn is_valid_name(name: &str) -> bool {
  !name.is_empty()
    && !name.starts_with('.')
    && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Check `request` against the key that authenticated and find the
/// repository on disk.
pub fn authorize(
  repo_root: &Path,
  key: &PublicKeyRecord,
  request: &GitRequest,
) -> Result<PathBuf, ServError> {
  if request.verb.is_write() && key.owner != request.owner {
    return Err(ServError::PushDenied {
      user: key.owner.clone(),
      owner: request.owner.clone(),
      repo: request.repo.clone(),
    });
  }
  let path = repo_root.join(&request.owner).join(format!("{}.git", request.repo));
  if !path.is_dir() {
    return Err(ServError::RepoNotFound);
  }
  Ok(path)
}

/// Run the requested Git command and return its exit code.
pub async fn run(settings: &Settings, key_arg: &str, original_command: Option<&str>) -> Result<u32, ServError> {
  let command = original_command.filter(|c| !c.is_empty()).ok_or(ServError::NoCommand)?;
  let key_id = parse_key_argument(key_arg)?;
  let registry = ConfigKeyRegistry::new(settings.public_keys.clone());
  let key = registry.find_by_id(key_id).ok_or(ServError::UnknownKey(key_id))?;

  let request = parse_command(command)?;
  let repo_path = authorize(&settings.repo_root_path, key, &request)?;
  tracing::debug!(?request, ?repo_path, key_id, "serving git command");

  let status = tokio::process::Command::new("git")
    .arg(request.verb.git_subcommand())
    .arg(&repo_path)
    .status()
    .await
    .map_err(ServError::Spawn)?;
  Ok(exit_code(&status))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(owner: &str) -> PublicKeyRecord {
    PublicKeyRecord {
      id: 1,
      owner: owner.to_owned(),
      content: "ssh-ed25519 AAAA".to_owned(),
    }
  }

  fn request(verb: Verb, owner: &str, repo: &str) -> GitRequest {
    GitRequest {
      verb,
      owner: owner.to_owned(),
      repo: repo.to_owned(),
    }
  }

  #[test]
  fn key_argument() {
    assert_eq!(parse_key_argument("key-17").unwrap(), 17);
    for bad in ["17", "key-", "key-x", "deploy-key-1"] {
      assert!(matches!(parse_key_argument(bad), Err(ServError::BadKeyArgument(_))));
    }
  }

  #[test]
  fn command_spellings() {
    let cases = [
      ("git-upload-pack 'user/repo.git'", Verb::UploadPack),
      ("git upload-pack '/user/repo.git'", Verb::UploadPack),
      ("git-receive-pack user/repo", Verb::ReceivePack),
      ("git-upload-archive \"user/repo.git/\"", Verb::UploadArchive),
    ];
    for (command, verb) in cases {
      assert_eq!(parse_command(command).unwrap(), request(verb, "user", "repo"), "{command}");
    }
  }

  #[test]
  fn leftover_wrapper_is_not_a_repo_path() {
    // What the exec sanitizer leaves of `'(git-receive-pack 'x/y.git')`.
    assert_eq!(
      parse_command("git-receive-pack 'x/y.git')").unwrap_err().to_string(),
      "invalid repository path \"x/y.git')\""
    );
  }

  #[test]
  fn unknown_commands() {
    for command in ["git", "git-upload-packs 'a/b'", "git-config a/b", "git-shell"] {
      assert!(matches!(parse_command(command), Err(ServError::UnknownCommand(_))), "{command}");
    }
  }

  #[test]
  fn traversal_is_rejected() {
    for path in ["'../etc.git'", "'a/../../b'", "'a'", "'a/b/c'", "'.ssh/authorized_keys'", "''"] {
      let command = format!("git-upload-pack {path}");
      assert!(matches!(parse_command(&command), Err(ServError::InvalidRepoPath(_))), "{command}");
    }
  }

  #[test]
  fn only_owner_may_push() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("alice/proj.git")).unwrap();

    let path = authorize(root.path(), &key("alice"), &request(Verb::ReceivePack, "alice", "proj")).unwrap();
    assert_eq!(path, root.path().join("alice/proj.git"));
    authorize(root.path(), &key("bob"), &request(Verb::UploadPack, "alice", "proj")).unwrap();

    let err = authorize(root.path(), &key("bob"), &request(Verb::ReceivePack, "alice", "proj")).unwrap_err();
    assert!(matches!(err, ServError::PushDenied { .. }));
  }

  #[test]
  fn missing_repository() {
    let root = tempfile::tempdir().unwrap();
    let err = authorize(root.path(), &key("alice"), &request(Verb::UploadPack, "alice", "nope")).unwrap_err();
    assert!(matches!(err, ServError::RepoNotFound));
  }

  #[tokio::test]
  async fn run_checks_before_spawning() {
    let settings = Settings::from_toml(
      r#"
        [[public_keys]]
        id = 1
        owner = "alice"
        content = "ssh-ed25519 AAAA"
      "#,
      Path::new("/nonexistent/app.toml"),
      "forge-ssh".into(),
    )
    .unwrap();

    assert!(matches!(run(&settings, "key-1", None).await, Err(ServError::NoCommand)));
    assert!(matches!(run(&settings, "key-1", Some("")).await, Err(ServError::NoCommand)));
    assert!(matches!(
      run(&settings, "key-2", Some("git-upload-pack 'alice/x.git'")).await,
      Err(ServError::UnknownKey(2))
    ));
    assert!(matches!(
      run(&settings, "key-1", Some("git-upload-pack 'alice/x.git'")).await,
      Err(ServError::RepoNotFound)
    ));
  }
}
