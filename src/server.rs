use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpSocket},
    sync::{mpsc, Mutex},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    barrier::Release,
    client::{self, ClientError},
    config::Config,
    draw::{self, DrawSummary},
    ledger::{Ledger, LedgerError},
    protocol::connection::Connection,
    registry::Registry,
};

/// State shared by every worker
#[derive(Clone)]
pub struct SharedLottery {
    pub ledger: Arc<dyn Ledger>,
    pub registry: Arc<Registry<Connection>>,
}

type JobSender = mpsc::UnboundedSender<Connection>;
type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<Connection>>>;

/// How a server run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Drawn(DrawSummary),
    ShutDown,
}

/// A handle that stops a running server
///
/// triggering it more than once is harmless, only the first call has an effect.
#[derive(Clone)]
pub struct Shutdown {
    token: CancellationToken,
    stopped: Arc<AtomicBool>,
    registry: Arc<Registry<Connection>>,
}

impl Shutdown {
    /// Stops accepting agencies, drops every open agency connection and
    /// releases the draw barrier so the server can return.
    ///
    /// returns false if the server was already shutting down
    pub fn trigger(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        match self.registry.barrier().released() {
            Some(Release::Completed) => tracing::info!("shutting down after the draw was released"),
            _ => tracing::info!("shutting down"),
        }

        // the acceptor and the workers drop their sockets once the token is cancelled
        self.token.cancel();

        let dropped = self.registry.close();
        tracing::info!(dropped, "closed the connections held for the draw");

        true
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct Server {
    listener: TcpListener,
    config: Config,
    lottery: SharedLottery,
    token: CancellationToken,
    shutdown: Shutdown,
}

impl Server {
    /// Binds the listening socket
    ///
    /// note: this function needs to be called from inside a tokio runtime context
    pub fn bind(config: Config, ledger: Arc<dyn Ledger>) -> tokio::io::Result<Self> {
        let socket = match config.bind_address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.bind_address)?;
        let listener = socket.listen(config.listen_backlog)?;

        let registry = Arc::new(Registry::new(config.agencies as usize));
        let token = CancellationToken::new();
        let shutdown = Shutdown {
            token: token.clone(),
            stopped: Arc::default(),
            registry: registry.clone(),
        };

        Ok(Self {
            listener,
            config,
            lottery: SharedLottery { ledger, registry },
            token,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> tokio::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Collects bets until every agency has finished, then runs the draw
    ///
    /// returns early, without a draw, when the server is shut down.
    pub async fn run(self) -> Result<Outcome, LedgerError> {
        let Self {
            listener,
            config,
            lottery,
            token,
            shutdown,
        } = self;

        let (jobs, queue) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(Mutex::new(queue));

        let mut tasks = JoinSet::new();
        tasks.spawn(accept(listener, jobs, token.clone()));
        for worker in 0..config.workers {
            tasks.spawn(work(
                worker,
                queue.clone(),
                lottery.clone(),
                token.clone(),
                config.queue_poll,
            ));
        }
        drop(queue);

        let outcome = match lottery.registry.barrier().wait().await {
            Release::Completed if !shutdown.is_triggered() => {
                draw::dispatch(
                    lottery.ledger.clone(),
                    &lottery.registry,
                    config.agencies,
                    config.winning_number,
                )
                .await
                .map(Outcome::Drawn)
            }
            _ => {
                tracing::info!("the draw was cancelled by a shutdown");
                Ok(Outcome::ShutDown)
            }
        };

        match &outcome {
            Ok(Outcome::Drawn(summary)) => tracing::info!(
                winners = summary.winners,
                notified = summary.notified.len(),
                dropped = summary.dropped.len(),
                "the draw is over"
            ),
            Ok(Outcome::ShutDown) => {}
            Err(err) => tracing::error!("the draw failed: {}", err),
        }

        // there is nothing left to collect once the barrier was released
        token.cancel();
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::error!("a server task failed: {}", err);
            }
        }

        outcome
    }
}

// Accepts agencies and queues their connections for the workers,
// the listening socket is closed once the loop returns
async fn accept(listener: TcpListener, jobs: JobSender, token: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("failed to accept a connection: {}", err);
                    continue;
                }
            },
        };

        tracing::debug!(%peer, "accepted a new connection");
        if jobs.send(Connection::new(stream, peer)).is_err() {
            break;
        }
    }

    tracing::debug!("stopped accepting connections");
}

// Pulls connections off the queue and handles them one at a time
async fn work(
    worker: usize,
    queue: JobQueue,
    lottery: SharedLottery,
    token: CancellationToken,
    poll: Duration,
) {
    while !token.is_cancelled() {
        // wait for a bounded time so a shutdown is noticed even when no agency connects
        let popped = tokio::time::timeout(poll, async { queue.lock().await.recv().await }).await;
        let connection = match popped {
            Ok(Some(connection)) => connection,
            Ok(None) => break,
            Err(_) => continue,
        };

        let peer = connection.peer();
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(worker, %peer, "dropped an in-flight connection");
            }
            handled = client::handle(connection, lottery.clone(), token.clone()) => match handled {
                Ok(handled) => tracing::debug!(worker, %peer, ?handled, "handled connection"),
                Err(ClientError::ConnectionClosed(err)) => {
                    tracing::info!(worker, %peer, "agency disconnected: {}", err)
                }
                Err(err) => tracing::warn!(worker, %peer, "failed to handle connection: {}", err),
            },
        }
    }

    tracing::debug!(worker, "worker stopped");
}
