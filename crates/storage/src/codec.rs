//! Reversible encoding for persisted workflow records.
//!
//! `encode(text) = base64(PREFIX + base64(uri_encode(text)))`. This is
//! obfuscation against casual inspection of the storage entry, not
//! encryption: anyone holding the record can decode it.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;

/// Marker prepended before the outer base64 layer.
pub const RECORD_PREFIX: &str = "intake:v1:";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("record is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("record is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("record prefix is missing")]
    MissingPrefix,
}

/// Encodes `text` for storage.
#[must_use]
pub fn encode(text: &str) -> String {
    let escaped = urlencoding::encode(text);
    let inner = BASE64.encode(escaped.as_bytes());
    BASE64.encode(format!("{RECORD_PREFIX}{inner}"))
}

/// Reverses [`encode`].
///
/// # Errors
///
/// Returns `CodecError` if either base64 layer, the prefix, or the escaped
/// text is malformed.
pub fn decode(encoded: &str) -> Result<String, CodecError> {
    let outer = String::from_utf8(BASE64.decode(encoded.trim())?)?;
    let inner = outer
        .strip_prefix(RECORD_PREFIX)
        .ok_or(CodecError::MissingPrefix)?;
    let escaped = String::from_utf8(BASE64.decode(inner)?)?;
    Ok(urlencoding::decode(&escaped)?.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_text() {
        for sample in [
            "",
            "plain",
            r#"{"formData":{"email":"a+b@example.com","notes":"50% done & more"}}"#,
            "ñandú — 子供 🧒",
            "line\nbreaks\tand\u{0}nulls",
        ] {
            assert_eq!(decode(&encode(sample)).unwrap(), sample);
        }
    }

    #[test]
    fn encoded_form_hides_plain_text() {
        let encoded = encode("childFirstName");
        assert!(!encoded.contains("childFirstName"));
        assert!(!encoded.contains(RECORD_PREFIX));
    }

    #[test]
    fn rejects_missing_prefix() {
        let forged = BASE64.encode("nope:abc");
        assert!(matches!(decode(&forged), Err(CodecError::MissingPrefix)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode("***"), Err(CodecError::Base64(_))));
    }
}
