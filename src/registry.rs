//! A [`KeyRegistry`] over the `[[public_keys]]` table of the config file.

use async_trait::async_trait;

use crate::auth::KeyRegistry;
use crate::config::PublicKeyRecord;

pub struct ConfigKeyRegistry {
  keys: Vec<PublicKeyRecord>,
}

/// `<algorithm> <base64>` of an `authorized_keys` line, ignoring the comment
/// and surrounding whitespace.
fn canonical(line: &str) -> Option<(&str, &str)> {
  let mut fields = line.split_whitespace();
  Some((fields.next()?, fields.next()?))
}

impl ConfigKeyRegistry {
  pub fn new(keys: Vec<PublicKeyRecord>) -> Self {
    Self { keys }
  }

  pub fn find_by_content(&self, content: &str) -> Option<&PublicKeyRecord> {
    let wanted = canonical(content)?;
    self.keys.iter().find(|k| canonical(&k.content) == Some(wanted))
  }

  pub fn find_by_id(&self, id: i64) -> Option<&PublicKeyRecord> {
    self.keys.iter().find(|k| k.id == id)
  }
}

#[async_trait]
impl KeyRegistry for ConfigKeyRegistry {
  async fn search_public_key_by_content(&self, content: &str) -> anyhow::Result<i64> {
    match self.find_by_content(content) {
      Some(key) => Ok(key.id),
      None => anyhow::bail!("public key does not exist [content: {content}]"),
    }
  }
}
