//! Checksum computation for optional copy verification.
//!
//! Size comparison is the baseline integrity check; a content checksum can be
//! switched on per job. Hashing of the source happens while its bytes stream
//! through the copy loop, so only the destination is read a second time.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit)
    Crc32,
    /// MD5 (kept for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(EngineError::InvalidConfig(format!(
                "unknown checksum algorithm '{}'; expected crc32, md5, sha256 or blake3",
                other
            ))),
        }
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

enum HasherState {
    Crc32(u32),
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

/// Incremental hasher fed chunk by chunk.
pub struct StreamHasher {
    state: HasherState,
}

impl StreamHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        use sha2::Digest;

        let state = match algorithm {
            ChecksumAlgorithm::Crc32 => HasherState::Crc32(0xffff_ffff),
            ChecksumAlgorithm::Md5 => HasherState::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => HasherState::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Blake3 => HasherState::Blake3(Box::new(blake3::Hasher::new())),
        };
        StreamHasher { state }
    }

    pub fn update(&mut self, data: &[u8]) {
        use sha2::Digest;

        match &mut self.state {
            HasherState::Crc32(crc) => {
                for &byte in data {
                    *crc ^= byte as u32;
                    for _ in 0..8 {
                        *crc = if *crc & 1 == 1 {
                            (*crc >> 1) ^ 0xedb8_8320
                        } else {
                            *crc >> 1
                        };
                    }
                }
            }
            HasherState::Md5(context) => context.consume(data),
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> ChecksumValue {
        use sha2::Digest;

        match self.state {
            HasherState::Crc32(crc) => {
                ChecksumValue::new(ChecksumAlgorithm::Crc32, format!("{:08x}", crc ^ 0xffff_ffff))
            }
            HasherState::Md5(context) => {
                ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", context.compute()))
            }
            HasherState::Sha256(hasher) => {
                ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", hasher.finalize()))
            }
            HasherState::Blake3(hasher) => ChecksumValue::new(
                ChecksumAlgorithm::Blake3,
                hasher.finalize().to_hex().to_string(),
            ),
        }
    }
}

/// Compute the checksum of a file, reading it in `chunk_size` pieces.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
) -> io::Result<ChecksumValue> {
    let mut file = File::open(path)?;
    let mut hasher = StreamHasher::new(algorithm);
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(hasher.finalize())
}
