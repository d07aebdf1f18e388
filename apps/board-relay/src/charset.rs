//! Outbound text encoding for channels that are not UTF-8.

use std::borrow::Cow;

use encoding_rs::Encoding;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CharsetError {
    #[error("unknown charset `{0}`")]
    Unknown(String),
}

pub fn lookup(label: &str) -> Result<&'static Encoding, CharsetError> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| CharsetError::Unknown(label.to_string()))
}

/// Encodes `text` for the wire. `None` sends UTF-8 unchanged.
///
/// Characters the target charset cannot represent become numeric
/// character references.
pub fn encode<'a>(
    text: &'a str,
    charset: Option<&str>,
) -> Result<Cow<'a, [u8]>, CharsetError> {
    let Some(label) = charset else {
        return Ok(Cow::Borrowed(text.as_bytes()));
    };
    let encoding = lookup(label)?;
    let (bytes, used, lossy) = encoding.encode(text);
    if lossy {
        debug!(
            target = "charset",
            charset = used.name(),
            "text contained unmappable characters"
        );
    }
    Ok(bytes)
}
