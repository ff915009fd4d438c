//! SSH string framing (RFC 4251 section 5): a big-endian `uint32` length
//! followed by that many bytes.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPayload {
  #[error("invalid SSH payload length (no size)")]
  MissingLength,
  #[error("invalid SSH payload length (missing data)")]
  MissingData,
}

/// Parse one string off the front of `payload`. Returns the string bytes and
/// whatever follows them.
pub fn parse_string(payload: &[u8]) -> Result<(&[u8], &[u8]), MalformedPayload> {
  let (header, body) = payload.split_first_chunk::<4>().ok_or(MalformedPayload::MissingLength)?;
  let length = u32::from_be_bytes(*header) as usize;
  if body.len() < length {
    return Err(MalformedPayload::MissingData);
  }
  Ok(body.split_at(length))
}

/// Append `value` to `buf` as an SSH string.
pub fn put_string(buf: &mut Vec<u8>, value: &[u8]) {
  // Anything longer than u32::MAX could never fit in an SSH packet anyway.
  let length = u32::try_from(value.len()).unwrap_or(u32::MAX);
  buf.extend_from_slice(&length.to_be_bytes());
  buf.extend_from_slice(&value[..length as usize]);
}

#[cfg(test)]
mod tests {
  use super::*;

  fn encode(value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_string(&mut buf, value);
    buf
  }

  #[test]
  fn short_header_is_rejected() {
    for len in 0..4 {
      let buf = vec![0u8; len];
      assert_eq!(parse_string(&buf), Err(MalformedPayload::MissingLength));
    }
  }

  #[test]
  fn declared_length_beyond_buffer_is_rejected() {
    let mut buf = encode(b"git-upload-pack");
    buf.truncate(buf.len() - 1);
    assert_eq!(parse_string(&buf), Err(MalformedPayload::MissingData));

    assert_eq!(parse_string(&[0, 0, 0, 1]), Err(MalformedPayload::MissingData));
    assert_eq!(parse_string(&[0xff, 0xff, 0xff, 0xff, b'g']), Err(MalformedPayload::MissingData));
  }

  #[test]
  fn returns_value_and_rest() {
    let mut buf = encode(b"LANG");
    put_string(&mut buf, b"en_US.UTF-8");

    let (name, rest) = parse_string(&buf).unwrap();
    assert_eq!(name, b"LANG");
    let (value, rest) = parse_string(rest).unwrap();
    assert_eq!(value, b"en_US.UTF-8");
    assert!(rest.is_empty());
  }

  #[test]
  fn bytes_are_preserved() {
    let raw = [0xffu8, 0x00, b'g', b'i', b't', 0x80];
    let buf = encode(&raw);
    assert_eq!(parse_string(&buf).unwrap(), (&raw[..], &[][..]));
  }

  #[test]
  fn empty_string() {
    assert_eq!(parse_string(&[0, 0, 0, 0, 7]).unwrap(), (&[][..], &[7u8][..]));
  }
}
