//! Checksum Module
//!
//! Every engine datagram carries an 8-byte header holding the first 8 bytes
//! of the MD5 digest of the rest of the datagram.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the reserved checksum header
pub const HEADER_LEN: usize = 8;

/// Calculate the 8-byte checksum of a payload
pub fn packet_checksum(payload: &[u8]) -> [u8; HEADER_LEN] {
    let digest: [u8; 16] = md5::compute(payload).into();
    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(&digest[..HEADER_LEN]);
    out
}

/// Prefix a payload with its checksum header
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&packet_checksum(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Verify a framed datagram and return its payload.
///
/// Returns `None` for datagrams shorter than the header or whose header does
/// not match the payload.
pub fn verify(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = datagram.split_at(HEADER_LEN);
    if *header == packet_checksum(payload) {
        Some(payload)
    } else {
        None
    }
}
