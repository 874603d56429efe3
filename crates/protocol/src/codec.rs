use bytes::{BufMut, Bytes, BytesMut};
use rkyv::{
    api::high::{HighSerializer, HighValidator},
    bytecheck::CheckBytes,
    de::Pool,
    ser::allocator::ArenaHandle,
    util::AlignedVec,
    Archive, Deserialize, Serialize,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::{StreamHeader, PROTOCOL_VERSION};

/// Largest header frame either side accepts.
pub const MAX_HEADER_FRAME: u32 = 4096;

/// Serialize `value` into a `Bytes` buffer using rkyv.
pub fn encode<T>(value: &T) -> Result<Bytes>
where
    T: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, rkyv::rancor::Error>>,
{
    let buf = rkyv::to_bytes::<rkyv::rancor::Error>(value)
        .map_err(|e| Error::Codec(e.to_string()))?;
    Ok(Bytes::from(buf.into_vec()))
}

/// Deserialize a `T` from the raw bytes produced by [`encode`].
///
/// `bytes` may have any alignment; it is copied into an aligned buffer first.
pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<HighValidator<'a, rkyv::rancor::Error>>
        + Deserialize<T, rkyv::rancor::Strategy<Pool, rkyv::rancor::Error>>,
{
    let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T, rkyv::rancor::Error>(&aligned).map_err(|e| Error::Codec(e.to_string()))
}

/// Write `header` as a 4-byte big-endian length followed by its encoding.
pub async fn write_header<W>(writer: &mut W, header: &StreamHeader) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let payload = encode(header)?;
    let len = payload.len() as u32;
    if len > MAX_HEADER_FRAME {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_HEADER_FRAME,
        });
    }

    // Length and body in one write.
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(len);
    frame.put_slice(&payload);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one header frame and check its protocol version.
pub async fn read_header<R>(reader: &mut R) -> Result<StreamHeader>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await?;
    if len > MAX_HEADER_FRAME {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_HEADER_FRAME,
        });
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    let header: StreamHeader = decode(&buf)?;

    if header.version != PROTOCOL_VERSION {
        return Err(Error::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: header.version,
        });
    }
    Ok(header)
}
