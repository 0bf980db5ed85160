use std::{collections::HashMap, sync::Arc};

use tokio::task;

use crate::{
    ledger::{Ledger, LedgerError},
    protocol::{
        connection::Connection,
        message::{AgencyId, Bet, ToAgency},
    },
    registry::Registry,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrawSummary {
    /// number of winning bets across every agency
    pub winners: usize,
    pub notified: Vec<AgencyId>,
    /// agencies whose notification could not be delivered
    pub dropped: Vec<AgencyId>,
}

pub fn is_winner(bet: &Bet, winning_number: i64) -> bool {
    bet.number == winning_number
}

/// Scans the whole ledger and collects the documents of the winning bets, per agency
pub fn winners_by_agency(
    ledger: &dyn Ledger,
    winning_number: i64,
) -> Result<HashMap<AgencyId, Vec<String>>, LedgerError> {
    let mut winners: HashMap<AgencyId, Vec<String>> = HashMap::new();
    for bet in ledger.scan_all()? {
        let bet = bet?;
        if is_winner(&bet, winning_number) {
            winners.entry(bet.agency).or_default().push(bet.document);
        }
    }

    Ok(winners)
}

/// Same as [`winners_by_agency`], but scans from the blocking thread pool
pub async fn tally(
    ledger: Arc<dyn Ledger>,
    winning_number: i64,
) -> Result<HashMap<AgencyId, Vec<String>>, LedgerError> {
    task::spawn_blocking(move || winners_by_agency(ledger.as_ref(), winning_number)).await?
}

/// Runs the draw and notifies every agency in `1..=agencies` of its winners
///
/// an agency without a registered connection, or whose connection fails,
/// only loses its own notification.
pub async fn dispatch(
    ledger: Arc<dyn Ledger>,
    registry: &Registry<Connection>,
    agencies: AgencyId,
    winning_number: i64,
) -> Result<DrawSummary, LedgerError> {
    let mut winners = tally(ledger, winning_number).await?;
    let mut connections = registry.take_all();

    let mut summary = DrawSummary {
        winners: winners.values().map(Vec::len).sum(),
        ..Default::default()
    };

    for agency in 1..=agencies {
        let documents = winners.remove(&agency).unwrap_or_default();
        let count = documents.len();

        let Some(mut connection) = connections.remove(&agency) else {
            tracing::warn!(agency, winners = count, "no connection registered, dropping notification");
            summary.dropped.push(agency);
            continue;
        };

        match connection.send(ToAgency::winners(documents)).await {
            Ok(()) => {
                tracing::info!(agency, winners = count, peer = %connection.peer(), "sent winners");
                summary.notified.push(agency);
            }
            Err(err) => {
                tracing::warn!(agency, winners = count, "failed to send winners: {}", err);
                summary.dropped.push(agency);
            }
        }
    }

    for (agency, connection) in connections {
        tracing::debug!(
            agency,
            peer = %connection.peer(),
            "closing connection of an agency outside the draw"
        );
        drop(connection);
    }

    Ok(summary)
}
