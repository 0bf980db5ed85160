use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::io::AsyncReadExt;

use super::message::{batch_flag, AgencyId, BatchHeader, Bet, BIRTHDATE_FORMAT};

#[async_trait]
pub trait Deserialize: Sized {
    type Error;

    // Deserialize a structure from a reader
    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializeError {
    #[error("{0}")]
    Utf(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("Unknown batch flag: {0:#04x}")]
    UnknownFlag(u8),

    #[error("The field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("The field '{field}' holds an invalid value: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("The record declared {declared} bytes but its fields only used {used}")]
    RecordLength { declared: usize, used: usize },

    #[error("The batch holds no records")]
    EmptyBatch,
}

/// A batch payload that could not be decoded in its entirety
#[derive(thiserror::Error, Debug)]
#[error("rejected the batch at record #{attempted}: {source}")]
pub struct DecodeError {
    pub attempted: usize,
    pub source: DeserializeError,
}

#[async_trait]
impl Deserialize for String {
    type Error = DeserializeError;
    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        // Read raw bytes
        let length = reader.read_u16().await?;
        let mut raw = vec![0u8; length as usize];
        reader.read_exact(&mut raw).await?;

        // Parse the raw bytes into a string
        let text = String::from_utf8(raw)?;

        Ok(text)
    }
}

async fn read_field<R: AsyncReadExt + Unpin + Send>(
    reader: &mut R,
    field: &'static str,
) -> Result<String, DeserializeError> {
    let value = String::deserialize(reader).await?;
    if value.is_empty() {
        return Err(DeserializeError::EmptyField(field));
    }

    Ok(value)
}

fn parse_field<T: std::str::FromStr>(
    value: String,
    field: &'static str,
) -> Result<T, DeserializeError> {
    value
        .parse()
        .map_err(|_| DeserializeError::InvalidField { field, value })
}

#[async_trait]
impl Deserialize for Bet {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        // every record carries its own length in front of the six fields
        let declared = reader.read_u16().await? as usize;
        let mut raw = vec![0u8; declared];
        reader.read_exact(&mut raw).await?;

        let mut record = raw.as_slice();
        let agency = read_field(&mut record, "agency").await?;
        let first_name = read_field(&mut record, "first_name").await?;
        let last_name = read_field(&mut record, "last_name").await?;
        let document = read_field(&mut record, "document").await?;
        let birthdate = read_field(&mut record, "birthdate").await?;
        let number = read_field(&mut record, "number").await?;

        if !record.is_empty() {
            return Err(DeserializeError::RecordLength {
                declared,
                used: declared - record.len(),
            });
        }

        let agency: AgencyId = parse_field(agency, "agency")?;
        if agency == 0 {
            return Err(DeserializeError::InvalidField {
                field: "agency",
                value: agency.to_string(),
            });
        }

        let birthdate = NaiveDate::parse_from_str(&birthdate, BIRTHDATE_FORMAT).map_err(|_| {
            DeserializeError::InvalidField {
                field: "birthdate",
                value: birthdate.clone(),
            }
        })?;

        Ok(Self {
            agency,
            first_name,
            last_name,
            document,
            birthdate,
            number: parse_field(number, "number")?,
        })
    }
}

#[async_trait]
impl Deserialize for BatchHeader {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let flag = reader.read_u8().await?;
        let last_from = match flag {
            batch_flag::MORE => None,
            batch_flag::FINAL => match reader.read_u8().await? {
                0 => {
                    return Err(DeserializeError::InvalidField {
                        field: "agency id",
                        value: "0".into(),
                    })
                }
                agency => Some(agency),
            },
            _ => return Err(DeserializeError::UnknownFlag(flag)),
        };

        Ok(Self {
            last_from,
            length: reader.read_u16().await?,
        })
    }
}

/// Decodes every record of a batch payload
///
/// the batch is all-or-nothing: a single malformed record rejects the entire payload,
/// and so does a payload without any record.
pub async fn decode_bets(mut payload: &[u8]) -> Result<Vec<Bet>, DecodeError> {
    let mut bets = Vec::new();
    while !payload.is_empty() {
        match Bet::deserialize(&mut payload).await {
            Ok(bet) => bets.push(bet),
            Err(source) => {
                return Err(DecodeError {
                    attempted: bets.len() + 1,
                    source,
                })
            }
        }
    }

    if bets.is_empty() {
        return Err(DecodeError {
            attempted: 0,
            source: DeserializeError::EmptyBatch,
        });
    }

    Ok(bets)
}
