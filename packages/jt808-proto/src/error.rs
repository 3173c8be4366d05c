use thiserror::Error;

/// Failures while unwrapping the outer `0x7E` frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame must start and end with 0x7e")]
    Framing,

    #[error("dangling 0x7d escape at end of frame")]
    DanglingEscape,

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("frame too short after unescaping: {0} bytes, need at least 13")]
    TooShort(usize),
}

/// Field-level failures inside a recognised message body.
///
/// These never tear a session down: the handler answers with a
/// "malformed" general response and moves on to the next frame.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("{msg} body truncated: need {need} bytes, have {have}")]
    Truncated {
        msg: &'static str,
        need: usize,
        have: usize,
    },
}

/// Failures in the per-connection stream scanner.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("read buffer exceeded {max} bytes without a complete frame")]
    OversizeBuffer { max: usize },
}
