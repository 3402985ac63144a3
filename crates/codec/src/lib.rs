//! Canonical serialization for the swarm.
//!
//! Peer records, gossip deltas, blocks and transactions are all encoded as
//! deterministic CBOR.  This crate wraps `ciborium` behind a small
//! `io::Result` API so every byte that crosses the wire or gets hashed goes
//! through one place.

use std::io::{self, Read, Write};

use ciborium::de::from_reader;
use ciborium::ser::into_writer;
use serde::{Serialize, de::DeserializeOwned};

/// Encode a value into canonical CBOR bytes.
pub fn to_vec_cbor<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_cbor(value, &mut buf)?;
    Ok(buf)
}

/// Encode a value into the provided sink.
pub fn write_cbor<T: Serialize, W: Write>(value: &T, mut writer: W) -> io::Result<()> {
    into_writer(value, &mut writer).map_err(|err| match err {
        ciborium::ser::Error::Io(io_err) => io_err,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    })
}

/// Decode a value from CBOR bytes.
pub fn from_slice_cbor<T: DeserializeOwned>(bytes: &[u8]) -> io::Result<T> {
    read_cbor(bytes)
}

/// Decode a value from an arbitrary reader.
pub fn read_cbor<T: DeserializeOwned, R: Read>(reader: R) -> io::Result<T> {
    from_reader(reader).map_err(|err| match err {
        ciborium::de::Error::Io(io_err) => io_err,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    })
}
