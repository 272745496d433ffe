/// Result alias that carries the custom [`AvatarError`] type.
pub type Result<T> = std::result::Result<T, AvatarError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum AvatarError {
    /// Remote text-to-speech failure or invalid input text.
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    /// Remote speech-to-text failure or an invalid upload.
    #[error("transcription failed: {0}")]
    Transcription(String),
    /// The render surface cannot be captured right now.
    #[error("capture failed: {0}")]
    Capture(String),
    /// Re-encoding the captured container failed. Callers convert this into a
    /// fallback rather than surfacing it.
    #[error("transcode failed: {0}")]
    Transcode(String),
    /// Audio or image bytes could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Configuration could not be read or is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Free-form message for conditions without a dedicated variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl AvatarError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`AvatarError::Capture`].
    pub fn capture<T: Into<String>>(msg: T) -> Self {
        Self::Capture(msg.into())
    }

    /// Shorthand for [`AvatarError::Decode`].
    pub fn decode<T: Into<String>>(msg: T) -> Self {
        Self::Decode(msg.into())
    }
}

impl From<&str> for AvatarError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for AvatarError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_stage() {
        let err = AvatarError::Synthesis("empty text".into());
        assert_eq!(err.to_string(), "speech synthesis failed: empty text");

        let err: AvatarError = "plain".into();
        assert!(matches!(err, AvatarError::Message(ref m) if m == "plain"));
    }

    #[test]
    fn io_failures_convert_without_losing_the_cause() {
        let err: AvatarError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, AvatarError::Io(_)));
        assert_eq!(err.to_string(), "gone");
    }
}
