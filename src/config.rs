//! Server configuration, loaded from environment variables.

use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:12345";
pub const DEFAULT_LISTEN_BACKLOG: u32 = 5;
pub const DEFAULT_AGENCIES: u8 = 5;
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_WINNING_NUMBER: i64 = 7574;
pub const DEFAULT_LEDGER_PATH: &str = "./bets.jsonl";
pub const DEFAULT_QUEUE_POLL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub listen_backlog: u32,
    /// number of agencies that must finish before the draw
    pub agencies: u8,
    pub workers: usize,
    pub winning_number: i64,
    pub ledger_path: PathBuf,
    /// how long an idle worker waits on the queue before checking for shutdown
    pub queue_poll: Duration,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.clone(),
        }),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("LOTTERY_BIND_ADDRESS")
            .map(String::as_str)
            .unwrap_or(DEFAULT_BIND_ADDRESS);
        let bind_address: SocketAddr =
            bind_address
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "LOTTERY_BIND_ADDRESS",
                    value: bind_address.to_string(),
                })?;

        let agencies = parse_var(vars, "LOTTERY_AGENCIES", DEFAULT_AGENCIES)?;
        if agencies == 0 {
            return Err(ConfigError::InvalidValue {
                name: "LOTTERY_AGENCIES",
                value: agencies.to_string(),
            });
        }

        let workers = parse_var(vars, "LOTTERY_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "LOTTERY_WORKERS",
                value: workers.to_string(),
            });
        }

        let ledger_path = vars
            .get("LOTTERY_LEDGER_PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LEDGER_PATH.to_string());

        Ok(Config {
            bind_address,
            listen_backlog: parse_var(vars, "LOTTERY_LISTEN_BACKLOG", DEFAULT_LISTEN_BACKLOG)?,
            agencies,
            workers,
            winning_number: parse_var(vars, "LOTTERY_WINNING_NUMBER", DEFAULT_WINNING_NUMBER)?,
            ledger_path: PathBuf::from(ledger_path),
            queue_poll: Duration::from_millis(parse_var(
                vars,
                "LOTTERY_QUEUE_POLL_MS",
                DEFAULT_QUEUE_POLL_MS,
            )?),
        })
    }
}
