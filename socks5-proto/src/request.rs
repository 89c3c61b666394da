use crate::{Address, Command, Error, ProtocolError};
use bytes::{BufMut, BytesMut};
use std::io::Result as IoResult;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 request
///
/// ```plain
/// +-----+-----+-------+------+----------+----------+
/// | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +-----+-----+-------+------+----------+----------+
/// |  1  |  1  | X'00' |  1   | Variable |    2     |
/// +-----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct Request {
    pub command: Command,
    pub address: Address,
}

impl Request {
    pub fn new(command: Command, address: Address) -> Self {
        Self { command, address }
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

        let mut buf = [0; 2];
        r.read_exact(&mut buf).await?;

        let command = Command::try_from(buf[0]).map_err(|command| {
            Error::Protocol(ProtocolError::InvalidCommand {
                version: ver,
                command,
            })
        })?;
        let address = Address::read_from(r).await?;

        Ok(Self { command, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> IoResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(crate::SOCKS_VERSION);
        buf.put_u8(u8::from(self.command));
        buf.put_u8(0x00);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn round_trips_connect() {
        let req = Request::new(Command::Connect, Address::from((Ipv4Addr::LOCALHOST, 8888)));
        let mut buf = Vec::new();
        req.write_to(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Request::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.command, Command::Connect);
        assert_eq!(decoded.address, req.address);
    }

    #[tokio::test]
    async fn rejects_unknown_command() {
        let mut buf = vec![0x05, 0x09, 0x00];
        Address::from((Ipv4Addr::LOCALHOST, 80)).write_to_buf(&mut buf);

        let mut cursor = std::io::Cursor::new(buf);
        let err = Request::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidCommand { command: 0x09, .. })
        ));
    }
}
