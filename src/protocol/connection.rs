use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    net::TcpStream,
};

use super::{
    deserializer::{decode_bets, DecodeError, Deserialize, DeserializeError},
    message::{Batch, BatchHeader, ToAgency},
    serializer::{Serialize, SerializeError},
};

/// An agency's socket, framed with the batch protocol
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

#[derive(thiserror::Error, Debug)]
pub enum ConnectionErr {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Serialize(#[from] SerializeError),
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read a single batch from the connection
    ///
    /// returns None when the agency disconnects before sending a single byte,
    /// a disconnection in the middle of a batch is reported as an Io error.
    pub async fn read_batch(&mut self) -> Result<Option<Batch>, ConnectionErr> {
        let mut flag = [0u8; 1];
        if self.stream.read(&mut flag).await? == 0 {
            return Ok(None);
        }

        // put the flag back in front of the stream so the header can be parsed as a whole
        let header = {
            let mut reader = (&flag[..]).chain(&mut self.stream);
            match BatchHeader::deserialize(&mut reader).await {
                Ok(header) => header,
                Err(DeserializeError::Io(err)) => return Err(err.into()),
                Err(source) => return Err(DecodeError { attempted: 0, source }.into()),
            }
        };

        let mut payload = BytesMut::zeroed(header.length as usize);
        self.stream.read_exact(&mut payload).await?;

        let bets = decode_bets(&payload).await?;

        Ok(Some(Batch {
            last_from: header.last_from,
            bets,
        }))
    }

    /// Writes the given message to the agency
    pub async fn send(&mut self, message: ToAgency) -> Result<(), ConnectionErr> {
        let mut writer = BufWriter::new(&mut self.stream);
        message.serialize(&mut writer).await?;
        writer.flush().await?;

        Ok(())
    }
}
