use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Agencies identify themselves with a single byte on the wire
pub type AgencyId = u8;

pub mod batch_flag {
    pub const MORE: u8 = 0x00;
    pub const FINAL: u8 = 0x01;
}

pub const ACK_MSG: &str = "BETS ACK\n";
pub const ERROR_MSG: &str = "ERROR\n";

// date layout used both on the wire and in the ledger
pub const BIRTHDATE_FORMAT: &str = "%Y-%m-%d";

/// A single wager placed at an agency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    pub agency: AgencyId,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: NaiveDate,
    pub number: i64,
}

/// The part of a batch that precedes its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchHeader {
    /// set when this is the agency's last batch
    pub last_from: Option<AgencyId>,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub last_from: Option<AgencyId>,
    pub bets: Vec<Bet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ToAgencyInternal {
    Ack,
    Error,
    Winners { documents: Vec<String> },
}

// Hide the internal ToAgency enum to provide a cleaner interface to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToAgency {
    pub(super) internal: ToAgencyInternal,
}

impl ToAgency {
    pub fn ack() -> Self {
        Self {
            internal: ToAgencyInternal::Ack,
        }
    }

    pub fn error() -> Self {
        Self {
            internal: ToAgencyInternal::Error,
        }
    }

    pub fn winners(documents: Vec<String>) -> Self {
        Self {
            internal: ToAgencyInternal::Winners { documents },
        }
    }
}
