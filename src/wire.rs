//! Per-stream protocol negotiation.
//!
//! The initiator of a stream writes one frame naming the protocol it wants:
//! a 2-byte big-endian length followed by the UTF-8 protocol id.  The
//! responder answers with the same frame to accept, or with a frame holding
//! [`REFUSED`] and then closes the stream.  Application bytes follow the
//! accepted frame directly, with no further framing.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum protocol id length in bytes.
pub const MAX_PROTOCOL_LEN: usize = 1024;

/// Responder answer for an unsupported protocol.
pub const REFUSED: &str = "na";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("protocol id of {0} bytes exceeds maximum ({MAX_PROTOCOL_LEN} bytes)")]
    TooLong(usize),

    #[error("protocol id is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream closed during negotiation")]
    UnexpectedEof,

    #[error("expected protocol {expected}, remote answered {actual}")]
    UnexpectedAnswer { expected: String, actual: String },

    #[error("remote refused protocol {0}")]
    Refused(String),

    #[error("\"{REFUSED}\" is reserved for refusals and cannot be requested")]
    ReservedProtocol,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode `protocol` as a negotiation frame.
pub fn encode_protocol(protocol: &str) -> Result<Bytes, WireError> {
    let len = protocol.len();
    if len > MAX_PROTOCOL_LEN {
        return Err(WireError::TooLong(len));
    }

    let mut buf = BytesMut::with_capacity(2 + len);
    buf.put_u16(len as u16);
    buf.extend_from_slice(protocol.as_bytes());
    Ok(buf.freeze())
}

/// Write one negotiation frame and flush it.
pub async fn write_protocol<S>(stream: &mut S, protocol: &str) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    let frame = encode_protocol(protocol)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one negotiation frame.
///
/// Returns `Ok(None)` if the stream ends before the length prefix.
pub async fn read_protocol<S>(stream: &mut S) -> Result<Option<String>, WireError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_PROTOCOL_LEN {
        return Err(WireError::TooLong(len));
    }

    let mut payload = vec![0u8; len];
    match stream.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::UnexpectedEof)
        }
        Err(e) => return Err(e.into()),
    }

    String::from_utf8(payload)
        .map(Some)
        .map_err(|_| WireError::InvalidUtf8)
}

/// Initiator side: request `protocol` and wait for the responder's answer.
pub async fn propose<S>(stream: &mut S, protocol: &str) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if protocol == REFUSED {
        return Err(WireError::ReservedProtocol);
    }
    write_protocol(stream, protocol).await?;

    match read_protocol(stream).await? {
        Some(answer) if answer == REFUSED => Err(WireError::Refused(protocol.to_string())),
        Some(answer) if answer == protocol => Ok(()),
        Some(answer) => Err(WireError::UnexpectedAnswer {
            expected: protocol.to_string(),
            actual: answer,
        }),
        None => Err(WireError::UnexpectedEof),
    }
}

/// Responder side: accept the protocol the initiator asked for.
pub async fn accept<S>(stream: &mut S, protocol: &str) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    write_protocol(stream, protocol).await
}

/// Responder side: refuse the requested protocol and close the stream.
pub async fn refuse<S>(stream: &mut S) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    write_protocol(stream, REFUSED).await?;
    stream.shutdown().await?;
    Ok(())
}
