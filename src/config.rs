use anyhow::{ensure, Result};

/// Products buffered before the writer flushes automatically
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Completed records that may wait between the parser thread and the writer
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Progress update interval (tick every N records)
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Titles longer than this are truncated on a char boundary
pub const TITLE_MAX_CHARS: usize = 500;

/// Upper bound on bind parameters in a single statement.
/// SQLite allows 32766 and Postgres 65535.
pub const MAX_BIND_PARAMS: usize = 30_000;

/// Keys per existence query issued by the cross-reference resolver
pub const RESOLVE_CHUNK_SIZE: usize = 5_000;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_USER: &str = "postgres";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub queue_capacity: usize,
    /// Stop after this many records have been emitted (dry runs, smoke tests)
    pub limit: Option<u64>,
    pub show_progress: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            limit: None,
            show_progress: false,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size >= 1, "batch size must be at least 1");
        ensure!(self.queue_capacity >= 1, "queue capacity must be at least 1");
        Ok(())
    }
}

/// Postgres connection URL from discrete parameters. Credentials are
/// percent-encoded so passwords may contain `@`, `:` or `/`.
pub fn postgres_url(host: &str, port: u16, name: &str, user: &str, pass: Option<&str>) -> String {
    let user = urlencoding::encode(user);
    match pass {
        Some(pass) => format!(
            "postgres://{user}:{}@{host}:{port}/{name}",
            urlencoding::encode(pass)
        ),
        None => format!("postgres://{user}@{host}:{port}/{name}"),
    }
}
