use std::{fmt, io};

#[derive(Debug)]
pub enum SplatError {
    CapacityExceeded {
        requested: usize,
        ceiling: usize,
        sh_degree: u8,
    },
    MalformedInput(String),
    IntegerOverflowRisk {
        extent: f32,
        limit: f32,
    },
    ParseSplat(String),
    EmptySection,
    ZstdCompress(String),
    ZstdDecompress(String),
    WorkerDisconnected,
    IoError(io::Error),
}

impl fmt::Display for SplatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplatError::CapacityExceeded {
                requested,
                ceiling,
                sh_degree,
            } => {
                write!(
                    f,
                    "Store would grow to {} splats, past the ceiling of {} for SH degree {}",
                    requested, ceiling, sh_degree
                )
            }
            SplatError::MalformedInput(e) => {
                write!(f, "Malformed compact splat data: {}", e)
            }
            SplatError::IntegerOverflowRisk { extent, limit } => {
                write!(
                    f,
                    "Candidate extent {} exceeds the safe integer-depth range {}",
                    extent, limit
                )
            }
            SplatError::ParseSplat(e) => {
                write!(f, "Failed to parse splats from the buffer: {}", e)
            }
            SplatError::EmptySection => {
                write!(f, "The splat section is empty.")
            }
            SplatError::ZstdCompress(e) => {
                write!(f, "Zstandard compression failed: {}", e)
            }
            SplatError::ZstdDecompress(e) => {
                write!(f, "Zstandard decompression failed: {}", e)
            }
            SplatError::WorkerDisconnected => {
                write!(f, "The sort worker channel is disconnected.")
            }
            SplatError::IoError(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
        }
    }
}

impl std::error::Error for SplatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SplatError::IoError(e) => Some(e),
            _ => None,
        }
    }
}
