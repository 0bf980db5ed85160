use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::message::{
    batch_flag, Batch, Bet, ToAgency, ToAgencyInternal, ACK_MSG, BIRTHDATE_FORMAT, ERROR_MSG,
};

#[async_trait]
pub trait Serialize: Sized {
    type Error;

    /// Serialize a structure into a writer
    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("The input is too long!")]
    TooLong,

    #[error("{0}")]
    Io(#[from] tokio::io::Error),
}

fn length_prefix(length: usize) -> Result<u16, SerializeError> {
    length.try_into().map_err(|_| SerializeError::TooLong)
}

#[async_trait]
impl Serialize for &str {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        writer.write_u16(length_prefix(self.len())?).await?;
        writer.write_all(self.as_bytes()).await?;

        Ok(())
    }
}

#[async_trait]
impl Serialize for Bet {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        // integers and dates travel as text, just like the names
        let fields = [
            self.agency.to_string(),
            self.first_name.clone(),
            self.last_name.clone(),
            self.document.clone(),
            self.birthdate.format(BIRTHDATE_FORMAT).to_string(),
            self.number.to_string(),
        ];

        let mut record = vec![];
        for field in fields.iter() {
            field.as_str().serialize(&mut record).await?;
        }

        writer.write_u16(length_prefix(record.len())?).await?;
        writer.write_all(&record).await?;

        Ok(())
    }
}

#[async_trait]
impl Serialize for Batch {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        let mut payload = vec![];
        for bet in self.bets.iter() {
            bet.serialize(&mut payload).await?;
        }
        let length = length_prefix(payload.len())?;

        match self.last_from {
            Some(agency) => {
                writer.write_u8(batch_flag::FINAL).await?;
                writer.write_u8(agency).await?;
            }
            None => writer.write_u8(batch_flag::MORE).await?,
        }
        writer.write_u16(length).await?;
        writer.write_all(&payload).await?;

        Ok(())
    }
}

#[async_trait]
impl Serialize for ToAgency {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        match &self.internal {
            ToAgencyInternal::Ack => ACK_MSG.serialize(writer).await?,
            ToAgencyInternal::Error => ERROR_MSG.serialize(writer).await?,
            ToAgencyInternal::Winners { documents } => {
                // the documents are concatenated without separators under a single total length
                let mut list = vec![];
                for document in documents {
                    document.as_str().serialize(&mut list).await?;
                }

                writer.write_u16(length_prefix(list.len())?).await?;
                writer.write_all(&list).await?;
            }
        };

        Ok(())
    }
}
