//! Error types for this library

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Unknown family value {0:#06x} in packet prefix")]
    UnknownFamily(u32),
    #[error("Frame of {0} bytes is shorter than the family prefix")]
    FrameTooShort(usize),
    #[error("Short write to tun device ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },
}
