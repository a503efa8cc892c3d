//! Server state and HTTP/WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::db::Db;
use crate::error::ChatError;
use crate::identity::TokenResolver;
use crate::registry::ConnectionRegistry;

/// Shared state accessible by all connection handlers and HTTP routes.
pub struct SharedState {
    pub config: ServerConfig,
    /// Message, notification and user store. Always locked before `registry`.
    pub db: Mutex<Db>,
    /// The only process-wide mutable connection state.
    pub registry: ConnectionRegistry,
    pub tokens: TokenResolver,
    pub started_at: Instant,
}

impl SharedState {
    pub fn new(config: ServerConfig, db: Db, tokens: TokenResolver) -> Arc<Self> {
        Arc::new(Self {
            config,
            db: Mutex::new(db),
            registry: ConnectionRegistry::new(),
            tokens,
            started_at: Instant::now(),
        })
    }

    /// Run a closure with the database. Errors are logged with full detail
    /// and surfaced as [`ChatError::Persistence`].
    pub fn with_db<F, R>(&self, f: F) -> Result<R, ChatError>
    where
        F: FnOnce(&Db) -> rusqlite::Result<R>,
    {
        let db = self.db.lock();
        f(&db).map_err(|e| {
            tracing::error!("Database error: {e}");
            ChatError::Persistence(e)
        })
    }
}

pub struct Server {
    config: ServerConfig,
    tokens: Option<TokenResolver>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, tokens: None }
    }

    /// Create a server with a fixed token resolver (for testing).
    pub fn with_tokens(config: ServerConfig, tokens: TokenResolver) -> Self {
        Self { config, tokens: Some(tokens) }
    }

    fn build_state(&self) -> Result<Arc<SharedState>> {
        let db = match &self.config.db_path {
            Some(path) => {
                tracing::info!("Opening database: {path}");
                Db::open(path).with_context(|| format!("Failed to open database {path}"))?
            }
            None => {
                tracing::warn!("No --db-path given, messages are kept in memory only");
                Db::open_memory().context("Failed to open in-memory database")?
            }
        };

        let tokens = match (&self.tokens, &self.config.token_secret) {
            (Some(tokens), _) => tokens.clone(),
            (None, Some(secret)) => TokenResolver::new(secret),
            (None, None) => {
                tracing::warn!("No token secret configured, using a random one; issued tokens will not survive a restart");
                TokenResolver::random()
            }
        };

        Ok(SharedState::new(self.config.clone(), db, tokens))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("HTTP/WebSocket listener on {}", self.config.listen_addr);
        let router = crate::web::router(state);
        axum::serve(listener, router).await?;
        Ok(())
    }

    /// Start the server and return the bound address, state and task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state()?;
        let router = crate::web::router(Arc::clone(&state));
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await?;
            Ok(())
        });
        Ok((addr, state, handle))
    }
}

/// In-memory state seeded with alice (client), bob (talent) and root (admin).
#[cfg(test)]
pub(crate) fn test_state() -> Arc<SharedState> {
    use crate::identity::Role;

    let db = Db::open_memory().unwrap();
    db.upsert_user("alice", Role::Client, Some("Alice")).unwrap();
    db.upsert_user("bob", Role::Talent, Some("Bob")).unwrap();
    db.upsert_user("root", Role::Admin, Some("Root")).unwrap();
    SharedState::new(ServerConfig::default(), db, TokenResolver::new("test-secret"))
}
