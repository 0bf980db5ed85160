use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::task;

use crate::protocol::message::Bet;

/// A lazy pass over every bet in a ledger
pub type BetScan<'a> = Box<dyn Iterator<Item = Result<Bet, LedgerError>> + Send + 'a>;

/// An append-only store of every bet the agencies have submitted
pub trait Ledger: Send + Sync {
    /// Stores a whole batch, concurrent appends never interleave their records
    fn append(&self, bets: &[Bet]) -> Result<(), LedgerError>;

    fn scan_all(&self) -> Result<BetScan<'_>, LedgerError>;
}

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ledger record: {0}")]
    Format(#[from] serde_json::Error),

    #[error("the ledger task failed: {0}")]
    Task(#[from] task::JoinError),
}

/// Appends a batch from the blocking thread pool and hands the bets back once stored
pub async fn append_blocking(
    ledger: Arc<dyn Ledger>,
    bets: Vec<Bet>,
) -> Result<Vec<Bet>, LedgerError> {
    task::spawn_blocking(move || ledger.append(&bets).map(|()| bets)).await?
}

/// Keeps the bets in a file, one json record per line
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLedger {
    /// Opens the ledger at the given path, creating it if necessary
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

impl Ledger for FileLedger {
    fn append(&self, bets: &[Bet]) -> Result<(), LedgerError> {
        // encode before taking the lock, only the write itself is serialized
        let mut lines = Vec::new();
        for bet in bets {
            serde_json::to_writer(&mut lines, bet)?;
            lines.push(b'\n');
        }

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&lines)?;
        file.flush()?;

        Ok(())
    }

    fn scan_all(&self) -> Result<BetScan<'_>, LedgerError> {
        let reader = BufReader::new(File::open(&self.path)?);

        let bets = reader.lines().filter_map(|line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str::<Bet>(&line).map_err(LedgerError::from)),
            Err(err) => Some(Err(err.into())),
        });

        Ok(Box::new(bets))
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryLedger {
    bets: Mutex<Vec<Bet>>,
}

#[cfg(test)]
impl Ledger for MemoryLedger {
    fn append(&self, bets: &[Bet]) -> Result<(), LedgerError> {
        self.bets.lock().unwrap().extend_from_slice(bets);
        Ok(())
    }

    fn scan_all(&self) -> Result<BetScan<'_>, LedgerError> {
        let bets = self.bets.lock().unwrap().clone();
        Ok(Box::new(bets.into_iter().map(Ok)))
    }
}

/// Blocks every call until the test opens the gate
#[cfg(test)]
#[derive(Debug)]
pub struct GatedLedger {
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
    inner: MemoryLedger,
}

#[cfg(test)]
impl GatedLedger {
    pub fn new(bets: &[Bet]) -> (std::sync::mpsc::Sender<()>, Self) {
        let (open, gate) = std::sync::mpsc::channel();
        let inner = MemoryLedger::default();
        inner.append(bets).unwrap();

        let ledger = Self {
            gate: Mutex::new(gate),
            inner,
        };
        (open, ledger)
    }

    fn pass(&self) -> Result<(), LedgerError> {
        self.gate
            .lock()
            .unwrap()
            .recv_timeout(std::time::Duration::from_secs(5))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "the gate never opened").into())
    }
}

#[cfg(test)]
impl Ledger for GatedLedger {
    fn append(&self, bets: &[Bet]) -> Result<(), LedgerError> {
        self.pass()?;
        self.inner.append(bets)
    }

    fn scan_all(&self) -> Result<BetScan<'_>, LedgerError> {
        self.pass()?;
        self.inner.scan_all()
    }
}
