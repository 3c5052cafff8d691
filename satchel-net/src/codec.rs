//! Request-response codecs: every stream carries exactly one varint-framed
//! message, and (for request/response message types) one framed reply.
//!
//! A clean EOF in place of the reply is the fire-and-forget case and maps
//! to `None`. An oversize length prefix is rejected before the body is
//! allocated and surfaces as an inbound/outbound failure on the stream.

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use satchel_wire::frame::{self, FrameError};
use std::io;

/// The byte length of a ping payload.
pub const PING_SIZE: usize = 32;

fn map_frame_err(err: FrameError) -> io::Error {
    match err {
        FrameError::Oversize { len, max } => io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversize-message: {len} > {max}"),
        ),
        FrameError::BadPrefix =>
            io::Error::new(io::ErrorKind::InvalidData, "bad length prefix"),
        FrameError::Io(e) => e,
    }
}

/// Frames serialized envelopes. The request is one framed envelope; the
/// response is an optional framed envelope, absent for fire-and-forget
/// message types.
#[derive(Clone)]
pub struct EnvelopeCodec {
    pub max_message_bytes: usize,
}

#[async_trait]
impl request_response::Codec for EnvelopeCodec {
    type Protocol = StreamProtocol;
    type Request = Vec<u8>;
    type Response = Option<Vec<u8>>;

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        frame::read_frame(io, self.max_message_bytes)
            .await
            .map_err(map_frame_err)?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before a message arrived",
                )
            })
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        frame::read_frame(io, self.max_message_bytes)
            .await
            .map_err(map_frame_err)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        frame::write_frame(io, &req, self.max_message_bytes)
            .await
            .map_err(map_frame_err)
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        rsp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        match rsp {
            Some(bytes) => frame::write_frame(io, &bytes, self.max_message_bytes)
                .await
                .map_err(map_frame_err),
            // Fire-and-forget: close without reply bytes.
            None => Ok(()),
        }
    }
}

/// The liveness probe: 32 random bytes echoed back verbatim.
#[derive(Clone, Default)]
pub struct PingCodec;

#[async_trait]
impl request_response::Codec for PingCodec {
    type Protocol = StreamProtocol;
    type Request = [u8; PING_SIZE];
    type Response = [u8; PING_SIZE];

    async fn read_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; PING_SIZE];
        io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn read_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let mut buf = [0u8; PING_SIZE];
        io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn write_request<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&req).await
    }

    async fn write_response<T>(
        &mut self,
        _protocol: &Self::Protocol,
        io: &mut T,
        rsp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        io.write_all(&rsp).await
    }
}

#[cfg(test)]
mod test {
    use futures::io::Cursor;
    use request_response::Codec;

    use super::*;

    fn proto() -> StreamProtocol {
        StreamProtocol::new(satchel_wire::proto::MESSAGE_PROTOCOL)
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let mut codec = EnvelopeCodec {
            max_message_bytes: 1024,
        };
        let payload = br#"{"type":"text"}"#.to_vec();

        let mut buf = Cursor::new(Vec::new());
        codec
            .write_request(&proto(), &mut buf, payload.clone())
            .await
            .unwrap();

        let mut rd = Cursor::new(buf.into_inner());
        let read = codec.read_request(&proto(), &mut rd).await.unwrap();
        assert_eq!(read, payload);
    }

    #[tokio::test]
    async fn empty_response_is_none() {
        let mut codec = EnvelopeCodec {
            max_message_bytes: 1024,
        };

        let mut buf = Cursor::new(Vec::new());
        codec.write_response(&proto(), &mut buf, None).await.unwrap();
        assert!(buf.get_ref().is_empty());

        let mut rd = Cursor::new(Vec::new());
        let read = codec.read_response(&proto(), &mut rd).await.unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn oversize_request_is_invalid_data() {
        let mut codec = EnvelopeCodec {
            max_message_bytes: 8,
        };
        // Write with a generous limit, read back with a tight one.
        let mut wide = EnvelopeCodec {
            max_message_bytes: 1024,
        };
        let mut buf = Cursor::new(Vec::new());
        wide.write_request(&proto(), &mut buf, vec![0u8; 64])
            .await
            .unwrap();

        let mut rd = Cursor::new(buf.into_inner());
        let err = codec.read_request(&proto(), &mut rd).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn ping_echo_roundtrip() {
        let mut codec = PingCodec;
        let nonce = [7u8; PING_SIZE];

        let mut buf = Cursor::new(Vec::new());
        codec.write_request(&proto(), &mut buf, nonce).await.unwrap();

        let mut rd = Cursor::new(buf.into_inner());
        let read = codec.read_request(&proto(), &mut rd).await.unwrap();
        assert_eq!(read, nonce);
    }
}
