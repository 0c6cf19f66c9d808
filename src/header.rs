//! The shared header every compiled artifact starts with.
//!
//! This is the only part of a compiled artifact's layout the server depends on: enough to
//! learn the compiler version that produced it and the install-dependencies it declares,
//! without knowing anything about the rest of the file.

use std::{
    io::Read,
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{error::ServerError, id::ResourceId};

const MAGIC: &[u8; 4] = b"ERBH";

/// Header read from the front of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHeader {
    pub compiler_version: i32,
    pub install_dependencies: Vec<ResourceId>,
    /// 64-bit content hash of the inputs at the time of compilation.
    pub source_data_hash: u64,
}

impl ResourceHeader {
    /// Serializes this header to the length-prefixed binary form `write_to` expects: a 4-byte
    /// magic, then a `u32` length, then a JSON body. The body is JSON (not a bespoke binary
    /// layout) because the header is metadata the server itself both writes (in tests, via the
    /// fixture compiler) and reads, and JSON keeps that symmetric without a second codec.
    pub fn write_to(&self, mut out: impl std::io::Write) -> std::io::Result<()> {
        let body = serde_json::to_vec(self).expect("ResourceHeader always serializes");
        out.write_all(MAGIC)?;
        out.write_all(&(body.len() as u32).to_le_bytes())?;
        out.write_all(&body)
    }

    /// Reads a header from the start of `reader`. Any malformed input (bad magic, truncated
    /// length, invalid JSON) is reported as [`ServerError::MalformedHeader`] so the caller
    /// (the up-to-date evaluator) can treat it uniformly as "needs compile".
    pub fn read_from(mut reader: impl Read, context: &Path) -> Result<Self, ServerError> {
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|_| ServerError::MalformedHeader(context.to_path_buf()))?;
        if &magic != MAGIC {
            return Err(ServerError::MalformedHeader(context.to_path_buf()));
        }
        let mut len_bytes = [0u8; 4];
        reader
            .read_exact(&mut len_bytes)
            .map_err(|_| ServerError::MalformedHeader(context.to_path_buf()))?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .map_err(|_| ServerError::MalformedHeader(context.to_path_buf()))?;
        serde_json::from_slice(&body).map_err(|_| ServerError::MalformedHeader(context.to_path_buf()))
    }

    /// Reads the header from the compiled artifact at `path`.
    pub fn read_from_file(path: &Path) -> Result<Self, ServerError> {
        let file = std::fs::File::open(path)
            .map_err(|_| ServerError::MalformedHeader(path.to_path_buf()))?;
        Self::read_from(std::io::BufReader::new(file), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{ResourcePath, ResourceTypeId};

    fn sample_header() -> ResourceHeader {
        ResourceHeader {
            compiler_version: 3,
            install_dependencies: vec![ResourceId::new(
                ResourceTypeId::new(b"msh"),
                ResourcePath::new("data://models/crate.msh").unwrap(),
            )],
            source_data_hash: 0xdead_beef_0011_2233,
        }
    }

    #[test]
    fn round_trips_through_write_and_read() {
        let header = sample_header();
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let read_back = ResourceHeader::read_from(&buf[..], Path::new("test")).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let buf = b"XXXX\x00\x00\x00\x00".to_vec();
        assert!(ResourceHeader::read_from(&buf[..], Path::new("test")).is_err());
    }

    #[test]
    fn rejects_truncated_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&100u32.to_le_bytes());
        buf.extend_from_slice(b"not enough bytes");
        assert!(ResourceHeader::read_from(&buf[..], Path::new("test")).is_err());
    }
}
