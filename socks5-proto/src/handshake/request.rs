use super::HandshakeMethod;
use crate::{Error, ProtocolError};
use bytes::{BufMut, BytesMut};
use std::io::Error as IoError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 handshake request
///
/// ```plain
/// +-----+----------+----------+
/// | VER | NMETHODS | METHODS  |
/// +-----+----------+----------+
/// |  1  |    1     | 1 to 255 |
/// +-----+----------+----------|
/// ```
#[derive(Clone, Debug)]
pub struct Request {
    pub methods: Vec<HandshakeMethod>,
}

impl Request {
    pub const fn new(methods: Vec<HandshakeMethod>) -> Self {
        Self { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let ver = r.read_u8().await?;

        if ver != crate::SOCKS_VERSION {
            return Err(Error::Protocol(ProtocolError::ProtocolVersion {
                version: ver,
            }));
        }

        let mlen = r.read_u8().await?;
        let mut methods = vec![0; mlen as usize];
        r.read_exact(&mut methods).await?;

        let methods = methods.into_iter().map(HandshakeMethod::from).collect();

        Ok(Self::new(methods))
    }

    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), IoError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        w.write_all(&buf).await?;

        Ok(())
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(crate::SOCKS_VERSION);
        buf.put_u8(self.methods.len() as u8);

        for method in &self.methods {
            buf.put_u8(u8::from(*method));
        }
    }

    pub fn serialized_len(&self) -> usize {
        1 + 1 + self.methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_method_list() {
        let req = Request::new(vec![HandshakeMethod::NO_AUTH, HandshakeMethod::USER_PASS]);
        let mut buf = Vec::new();
        req.write_to(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x02, 0x00, 0x02]);

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Request::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.methods, req.methods);
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let mut cursor = std::io::Cursor::new([0x04, 0x01, 0x00]);
        let err = Request::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ProtocolVersion { version: 0x04 })
        ));
    }
}
