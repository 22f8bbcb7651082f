use crate::error::BotError;
use crate::execution::position_ledger::LedgerSnapshot;
use crate::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::{timeout, Duration};

/// Durable home of the position ledger. A failing store is fatal.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load(&self, instrument: &str) -> Result<Option<LedgerSnapshot>>;
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

/// Ledger as a JSON document on disk, replaced atomically on each save
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LedgerStore for JsonFileStore {
    async fn load(&self, instrument: &str) -> Result<Option<LedgerSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;

        if snapshot.instrument != instrument {
            return Err(BotError::LedgerStore {
                reason: format!(
                    "{} holds a ledger for {}, not {}",
                    self.path.display(),
                    snapshot.instrument,
                    instrument
                ),
            });
        }
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "Ledger saved");
        Ok(())
    }
}

/// Ledger stored in Redis under `ledger:{instrument}`
pub struct RedisLedgerStore {
    conn: ConnectionManager,
}

impl RedisLedgerStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| BotError::LedgerStore {
                reason: "Redis connection timeout after 5 seconds".to_string(),
            })??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(instrument: &str) -> String {
        format!("ledger:{}", instrument)
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn load(&self, instrument: &str) -> Result<Option<LedgerSnapshot>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::key(instrument)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(snapshot)?;
        conn.set::<_, _, ()>(Self::key(&snapshot.instrument), json)
            .await?;
        Ok(())
    }
}

/// In-memory store; can be told to fail for fault tests
#[derive(Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Option<LedgerSnapshot>>>,
    saves: Arc<Mutex<u32>>,
    fail: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<LedgerSnapshot> {
        self.saved.lock().ok().and_then(|s| s.clone())
    }

    pub fn save_count(&self) -> u32 {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut fail) = self.fail.lock() {
            *fail = failing;
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load(&self, _instrument: &str) -> Result<Option<LedgerSnapshot>> {
        Ok(self.latest())
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        if self.fail.lock().map(|f| *f).unwrap_or(true) {
            return Err(BotError::LedgerStore {
                reason: "store unavailable".to_string(),
            });
        }
        let mut saved = self.saved.lock().map_err(|e| BotError::LedgerStore {
            reason: e.to_string(),
        })?;
        *saved = Some(snapshot.clone());
        drop(saved);
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }
}
