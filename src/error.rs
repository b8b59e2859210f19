//! Error handling helpers and primitives.

use anyhow::Error;
use thiserror::Error as ThisError;

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

#[derive(Debug, ThisError)]
/// Errors raised while decoding worker frames or Nix command output. All of
/// them are fatal for the current task.
pub enum ProtocolError {
    /// A frame length prefix exceeded the configured ceiling.
    #[error("frame of {0} bytes exceeds the {1} byte ceiling")]
    FrameTooLarge(u64, u64),

    /// The stream ended in the middle of a frame payload.
    #[error("truncated frame, wanted {0} payload bytes")]
    Truncated(usize),

    /// A payload carried a variant tag this agent does not know.
    #[error("unknown variant tag {0:#04x}")]
    UnknownTag(u8),

    /// A payload body did not match its variant layout.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Output of a Nix invocation could not be parsed.
    #[error("unparseable nix output: {0}")]
    NixOutput(String),
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }

    #[test]
    fn protocol_error_display() {
        let err = super::ProtocolError::UnknownTag(0xab);
        assert_eq!(err.to_string(), "unknown variant tag 0xab");
    }
}
