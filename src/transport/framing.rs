//! Wire Framing
//!
//! Byte-exact frame and handshake layouts. These must not change: any legacy
//! peer on the wire expects exactly these offsets and markers.
//!
//! - Batched small message: `[2-byte LE length][payload][0xEF]`
//! - Bulk message: `[4-byte LE length][payload][0xEF]`
//! - Stream handshake: `[1-byte kind][2-byte LE port][0xEF]`

use anyhow::{Result, bail};
use tokio::io::{AsyncRead, AsyncReadExt};

/// End-of-message marker closing every frame and the handshake.
pub const END_MARKER: u8 = 0xEF;
/// Handshake kind: batched small-message channel.
pub const KIND_SMALL: u8 = 1;
/// Handshake kind: bulk channel.
pub const KIND_BULK: u8 = 2;
/// Handshake length: kind, port, marker.
pub const HANDSHAKE_LEN: usize = 4;

/// Frame a small message: 2-byte little-endian length, payload, end marker.
/// A payload that does not fit the length field is a programming error; such
/// messages belong on the bulk path.
pub fn make_small_frame(payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= u16::MAX as usize,
        "payload of {} bytes does not fit a small frame",
        payload.len()
    );
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(END_MARKER);
    frame
}

/// Read one small frame, validating the end marker.
pub async fn read_small_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes).await?;
    let len = u16::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut marker = [0u8; 1];
    reader.read_exact(&mut marker).await?;
    if marker[0] != END_MARKER {
        bail!(
            "corrupted frame: end marker {:#04x}, expected {:#04x}",
            marker[0],
            END_MARKER
        );
    }
    Ok(payload)
}

/// Frame a bulk message: 4-byte little-endian length, payload, end marker.
pub fn make_bulk_frame(payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= u32::MAX as usize,
        "payload of {} bytes does not fit a bulk frame",
        payload.len()
    );
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(END_MARKER);
    frame
}

/// Read one bulk frame, validating the end marker.
pub async fn read_bulk_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let mut marker = [0u8; 1];
    reader.read_exact(&mut marker).await?;
    if marker[0] != END_MARKER {
        bail!(
            "corrupted bulk frame: end marker {:#04x}, expected {:#04x}",
            marker[0],
            END_MARKER
        );
    }
    Ok(payload)
}

/// Build the stream-opening handshake announcing the connection kind and the
/// sender's own listening port. Sending an unknown kind is a programming
/// error.
pub fn make_handshake(kind: u8, port: u16) -> [u8; HANDSHAKE_LEN] {
    assert!(
        kind == KIND_SMALL || kind == KIND_BULK,
        "invalid connection kind {}",
        kind
    );
    let port = port.to_le_bytes();
    [kind, port[0], port[1], END_MARKER]
}

/// Read and validate a handshake; returns (kind, announced port). A garbled
/// handshake is an error the receiver answers by dropping the connection.
pub async fn read_handshake<R>(reader: &mut R) -> Result<(u8, u16)>
where
    R: AsyncRead + Unpin,
{
    let mut handshake = [0u8; HANDSHAKE_LEN];
    reader.read_exact(&mut handshake).await?;
    if handshake[3] != END_MARKER {
        bail!("garbled handshake: marker {:#04x}", handshake[3]);
    }
    if handshake[0] != KIND_SMALL && handshake[0] != KIND_BULK {
        bail!("garbled handshake: unknown connection kind {}", handshake[0]);
    }
    Ok((handshake[0], u16::from_le_bytes([handshake[1], handshake[2]])))
}
