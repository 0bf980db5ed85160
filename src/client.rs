use tokio_util::sync::CancellationToken;

use crate::{
    ledger::{self, LedgerError},
    protocol::{
        connection::{Connection, ConnectionErr},
        deserializer::DecodeError,
        message::{AgencyId, ToAgency},
        serializer::SerializeError,
    },
    registry::{Registration, RegistryError},
    server::SharedLottery,
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("the connection was closed: {0}")]
    ConnectionClosed(#[source] tokio::io::Error),

    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("failed to store the batch: {0}")]
    Store(#[from] LedgerError),

    #[error("failed to encode the response: {0}")]
    Response(#[source] SerializeError),

    #[error("the server is shutting down")]
    ShutdownInProgress,

    #[error("agency {0} is not taking part in the draw")]
    UnknownAgency(AgencyId),
}

impl From<ConnectionErr> for ClientError {
    fn from(err: ConnectionErr) -> Self {
        match err {
            ConnectionErr::Io(err) | ConnectionErr::Serialize(SerializeError::Io(err)) => {
                Self::ConnectionClosed(err)
            }
            ConnectionErr::Serialize(err) => Self::Response(err),
            ConnectionErr::Decode(err) => Self::Decode(err),
        }
    }
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ShutdownInProgress => Self::ShutdownInProgress,
            RegistryError::UnknownAgency(agency) => Self::UnknownAgency(agency),
        }
    }
}

/// How a connection was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// the agency disconnected before sending anything
    Abandoned,
    /// the batch was stored and the connection closed
    Stored { bets: usize },
    /// the agency's last batch was stored and its connection kept for the draw
    Registered { agency: AgencyId, bets: usize },
}

/// Drives a single agency connection
///
/// reads one batch, stores it, and acknowledges it.
/// when it was the agency's last batch the connection is handed to the registry,
/// otherwise it is closed once the handler returns.
pub async fn handle(
    mut connection: Connection,
    lottery: SharedLottery,
    token: CancellationToken,
) -> Result<Handled, ClientError> {
    if token.is_cancelled() {
        return Err(ClientError::ShutdownInProgress);
    }

    let peer = connection.peer();
    let batch = match connection.read_batch().await {
        Ok(Some(batch)) => batch,
        Ok(None) => return Ok(Handled::Abandoned),
        Err(ConnectionErr::Decode(err)) => {
            tracing::warn!(%peer, attempted = err.attempted, "rejected batch: {}", err.source);

            // the batch is lost either way, a failed error report changes nothing
            if let Err(reason) = connection.send(ToAgency::error()).await {
                tracing::debug!(%peer, "failed to report the error: {}", reason);
            }

            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    if let Some(agency) = batch.last_from.filter(|&agency| !lottery.registry.accepts(agency)) {
        tracing::warn!(%peer, agency, "rejected batch from an agency outside the draw");
        if let Err(reason) = connection.send(ToAgency::error()).await {
            tracing::debug!(%peer, "failed to report the error: {}", reason);
        }

        return Err(ClientError::UnknownAgency(agency));
    }

    let count = batch.bets.len();
    let bets = match ledger::append_blocking(lottery.ledger.clone(), batch.bets).await {
        Ok(bets) => bets,
        Err(err) => {
            tracing::error!(%peer, bets = count, "failed to store batch: {}", err);
            return Err(err.into());
        }
    };

    if let Some(bet) = bets.first() {
        tracing::info!(
            %peer,
            bets = count,
            agency = bet.agency,
            first_name = %bet.first_name,
            last_name = %bet.last_name,
            document = %bet.document,
            birthdate = %bet.birthdate,
            number = bet.number,
            "stored batch"
        );
    }

    connection.send(ToAgency::ack()).await?;

    let Some(agency) = batch.last_from else {
        return Ok(Handled::Stored { bets: count });
    };

    match lottery.registry.register(agency, connection)? {
        Registration::Inserted { registered } => tracing::info!(
            %peer,
            agency,
            registered,
            "agency has finished, holding its connection for the draw"
        ),
        Registration::Replaced { registered } => tracing::warn!(
            %peer,
            agency,
            registered,
            "agency registered again, replacing its previous connection"
        ),
    }

    Ok(Handled::Registered {
        agency,
        bets: count,
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::NaiveDate;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_util::sync::CancellationToken;

    use super::{handle, ClientError, Handled};
    use crate::{
        ledger::{BetScan, Ledger, LedgerError, MemoryLedger},
        protocol::{
            connection::Connection,
            deserializer::DeserializeError,
            message::{Batch, Bet},
            serializer::Serialize,
        },
        registry::Registry,
        server::SharedLottery,
    };

    struct BrokenLedger;

    impl Ledger for BrokenLedger {
        fn append(&self, _: &[Bet]) -> Result<(), LedgerError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into())
        }

        fn scan_all(&self) -> Result<BetScan<'_>, LedgerError> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    fn bet(agency: u8, number: i64) -> Bet {
        Bet {
            agency,
            first_name: "Santiago Lionel".into(),
            last_name: "Lorca".into(),
            document: "30904465".into(),
            birthdate: NaiveDate::from_ymd_opt(1999, 3, 17).unwrap(),
            number,
        }
    }

    fn shared_lottery(ledger: Arc<dyn Ledger>) -> SharedLottery {
        SharedLottery {
            ledger,
            registry: Arc::new(Registry::new(5)),
        }
    }

    // returns the agency side of the socket and the server side connection
    async fn socket_pair() -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agency = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        (agency, Connection::new(stream, peer))
    }

    async fn send_batch(agency: &mut TcpStream, batch: Batch) {
        batch.serialize(agency).await.unwrap();
    }

    async fn read_to_end(agency: &mut TcpStream) -> Vec<u8> {
        let mut raw = vec![];
        tokio::time::timeout(Duration::from_secs(1), agency.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();
        raw
    }

    #[tokio::test]
    async fn stores_and_acknowledges_a_batch() {
        let ledger = Arc::new(MemoryLedger::default());
        let lottery = shared_lottery(ledger.clone());
        let (mut agency, connection) = socket_pair().await;

        send_batch(
            &mut agency,
            Batch {
                last_from: None,
                bets: vec![bet(2, 1), bet(2, 2)],
            },
        )
        .await;

        let handled = handle(connection, lottery.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled, Handled::Stored { bets: 2 });

        // the ack is followed by the connection being closed
        assert_eq!(read_to_end(&mut agency).await, b"\x00\x09BETS ACK\n");
        assert_eq!(ledger.scan_all().unwrap().count(), 2);
        assert!(lottery.registry.take_all().is_empty());
    }

    #[tokio::test]
    async fn last_batch_keeps_the_connection() {
        let ledger = Arc::new(MemoryLedger::default());
        let lottery = shared_lottery(ledger.clone());
        let (mut agency, connection) = socket_pair().await;

        send_batch(
            &mut agency,
            Batch {
                last_from: Some(4),
                bets: vec![bet(4, 7574)],
            },
        )
        .await;

        let handled = handle(connection, lottery.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled, Handled::Registered { agency: 4, bets: 1 });

        let mut ack = [0u8; 11];
        agency.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"\x00\x09BETS ACK\n");

        // nothing else arrives while the registry holds the connection
        let mut next = [0u8; 1];
        let pending =
            tokio::time::timeout(Duration::from_millis(50), agency.read(&mut next)).await;
        assert!(pending.is_err());

        assert_eq!(lottery.registry.take_all().len(), 1);
    }

    #[tokio::test]
    async fn malformed_batch_gets_an_error_frame() {
        let ledger = Arc::new(MemoryLedger::default());
        let lottery = shared_lottery(ledger.clone());
        let (mut agency, connection) = socket_pair().await;

        // a final batch whose only record is cut short
        agency
            .write_all(b"\x01\x01\x00\x05\x00\x29\x00\x013")
            .await
            .unwrap();

        let result = handle(connection, lottery.clone(), CancellationToken::new()).await;
        match result {
            Err(ClientError::Decode(err)) => assert_eq!(err.attempted, 1),
            other => panic!("expected a decode failure, got {:?}", other),
        }

        assert_eq!(read_to_end(&mut agency).await, b"\x00\x06ERROR\n");
        assert_eq!(ledger.scan_all().unwrap().count(), 0);
        assert!(lottery.registry.take_all().is_empty());
    }

    #[tokio::test]
    async fn agency_id_zero_gets_an_error_frame() {
        let ledger = Arc::new(MemoryLedger::default());
        let lottery = shared_lottery(ledger.clone());
        let (mut agency, connection) = socket_pair().await;

        // the header is refused before any of the payload is read
        agency.write_all(b"\x01\x00\x00\x00").await.unwrap();

        let result = handle(connection, lottery.clone(), CancellationToken::new()).await;
        match result {
            Err(ClientError::Decode(err)) => assert!(matches!(
                err.source,
                DeserializeError::InvalidField {
                    field: "agency id",
                    ..
                }
            )),
            other => panic!("expected a decode failure, got {:?}", other),
        }

        assert_eq!(read_to_end(&mut agency).await, b"\x00\x06ERROR\n");
        assert_eq!(ledger.scan_all().unwrap().count(), 0);
        assert_eq!(lottery.registry.barrier().released(), None);
    }

    #[tokio::test]
    async fn agency_outside_the_draw_is_not_registered() {
        let ledger = Arc::new(MemoryLedger::default());
        let lottery = SharedLottery {
            ledger: ledger.clone(),
            registry: Arc::new(Registry::new(2)),
        };

        let (mut stray, connection) = socket_pair().await;
        send_batch(
            &mut stray,
            Batch {
                last_from: Some(3),
                bets: vec![bet(3, 7574)],
            },
        )
        .await;

        let result = handle(connection, lottery.clone(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::UnknownAgency(3))));
        assert_eq!(read_to_end(&mut stray).await, b"\x00\x06ERROR\n");
        assert_eq!(ledger.scan_all().unwrap().count(), 0);

        // agency 1 alone must not complete a draw of two agencies
        let (mut agency, connection) = socket_pair().await;
        send_batch(
            &mut agency,
            Batch {
                last_from: Some(1),
                bets: vec![bet(1, 7574)],
            },
        )
        .await;

        let handled = handle(connection, lottery.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled, Handled::Registered { agency: 1, bets: 1 });
        assert_eq!(lottery.registry.barrier().released(), None);
    }

    #[tokio::test]
    async fn silent_agency_is_abandoned() {
        let lottery = shared_lottery(Arc::new(MemoryLedger::default()));
        let (agency, connection) = socket_pair().await;
        drop(agency);

        let handled = handle(connection, lottery, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled, Handled::Abandoned);
    }

    #[tokio::test]
    async fn disconnect_mid_batch_is_a_closed_connection() {
        let lottery = shared_lottery(Arc::new(MemoryLedger::default()));
        let (mut agency, connection) = socket_pair().await;

        // announce 300 bytes and hang up after 3 of them
        agency
            .write_all(b"\x00\x01\x2c\x00\x29\x00")
            .await
            .unwrap();
        drop(agency);

        let result = handle(connection, lottery, CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn store_failure_skips_the_ack() {
        let lottery = shared_lottery(Arc::new(BrokenLedger));
        let (mut agency, connection) = socket_pair().await;

        send_batch(
            &mut agency,
            Batch {
                last_from: Some(1),
                bets: vec![bet(1, 3)],
            },
        )
        .await;

        let result = handle(connection, lottery.clone(), CancellationToken::new()).await;
        assert!(matches!(result, Err(ClientError::Store(_))));

        assert!(read_to_end(&mut agency).await.is_empty());
        assert!(lottery.registry.take_all().is_empty());
    }

    #[tokio::test]
    async fn nothing_is_handled_after_shutdown() {
        let lottery = shared_lottery(Arc::new(MemoryLedger::default()));
        let (_agency, connection) = socket_pair().await;

        let token = CancellationToken::new();
        token.cancel();

        let result = handle(connection, lottery, token).await;
        assert!(matches!(result, Err(ClientError::ShutdownInProgress)));
    }
}
