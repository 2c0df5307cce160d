use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use heron_common::config::HeronConfig;
use heron_common::error::HeronResult;
use heron_common::types::DataType;

use crate::ast::ParsedStatement;
use crate::backend::Backend;
use crate::connection::PgConnection;
use crate::generator;
use crate::registry::SessionRegistry;
use crate::session::PgSession;
use crate::statement::PgStatement;
use crate::statement_cache::{StatementCache, StatementKey};

/// Process-scoped state shared by every connection of one server: the
/// external services, the statement cache, the session registry and the
/// schema generation counter.
pub struct ServerContext {
    pub config: HeronConfig,
    pub backend: Backend,
    pub cache: StatementCache,
    pub registry: SessionRegistry,
    schema_generation: AtomicU64,
    next_session_id: AtomicI32,
    active_connections: AtomicUsize,
    shutdown_requested: AtomicBool,
    shutdown_notify: Notify,
}

impl ServerContext {
    pub fn new(config: HeronConfig, backend: Backend) -> Self {
        let cache = StatementCache::new(config.cache.capacity);
        Self {
            config,
            backend,
            cache,
            registry: SessionRegistry::new(),
            schema_generation: AtomicU64::new(0),
            next_session_id: AtomicI32::new(1),
            active_connections: AtomicUsize::new(0),
            shutdown_requested: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.schema_generation.load(Ordering::Acquire)
    }

    /// Advance the schema generation; returns the new value.
    pub fn bump_generation(&self) -> u64 {
        self.schema_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn next_session_id(&self) -> i32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn connection_opened(&self) -> usize {
        let n = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        heron_observability::record_active_connections(n);
        n
    }

    pub(crate) fn connection_closed(&self) {
        let n = self.active_connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        heron_observability::record_active_connections(n);
    }

    /// Statement for `parsed`, from the cache when a current entry exists.
    ///
    /// The generation is read before compiling, so a schema change racing
    /// with compilation leaves the new entry already stale rather than
    /// wrongly current.
    pub fn generate(
        &self,
        session: &mut PgSession,
        parsed: &ParsedStatement,
        param_oids: &[i32],
    ) -> HeronResult<Arc<dyn PgStatement>> {
        let generation = self.current_generation();
        let key = StatementKey::new(&parsed.sql, param_oids);
        if let Some(stmt) = self.cache.get(&key, generation) {
            return Ok(stmt);
        }

        let param_types: Vec<Option<DataType>> = param_oids
            .iter()
            .map(|&oid| if oid == 0 { None } else { DataType::from_oid(oid) })
            .collect();
        let stmt = generator::generate(self, session, parsed, &param_types, generation)?;
        self.cache.insert(key, stmt.clone());
        Ok(stmt)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`request_shutdown`](Self::request_shutdown) has been called.
    pub async fn wait_for_shutdown(&self) {
        loop {
            let notified = self.shutdown_notify.notified();
            if self.shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Terminate every session and drop process-scoped state.
    pub fn stop(&self) {
        self.registry.disconnect_all();
        self.registry.clear();
        self.cache.clear();
        tracing::info!("server state cleared");
    }
}

/// PostgreSQL-compatible TCP server.
///
/// The accept loop runs on tokio; each connection runs the protocol state
/// machine synchronously on a blocking worker thread.
pub struct PgServer {
    context: Arc<ServerContext>,
}

impl PgServer {
    pub fn new(config: HeronConfig, backend: Backend) -> Self {
        Self {
            context: Arc::new(ServerContext::new(config, backend)),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub async fn bind(&self) -> HeronResult<TcpListener> {
        let addr = &self.context.config.server.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Heron PG server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Listen on the configured address until `shutdown` resolves or a
    /// SHUTDOWN statement is executed.
    pub async fn run_with_shutdown(
        &self,
        shutdown: impl std::future::Future<Output = ()>,
        drain_timeout: Duration,
    ) -> HeronResult<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown, drain_timeout).await
    }

    /// Accept connections from `listener` until shutdown, then wait up to
    /// `drain_timeout` for active connections before clearing server state.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
        drain_timeout: Duration,
    ) -> HeronResult<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::info!("New connection from {}", addr);
                            self.spawn_connection(stream);
                        }
                        Err(e) => tracing::warn!("accept failed: {}", e),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received, stopping new connections");
                    break;
                }
                _ = self.context.wait_for_shutdown() => {
                    tracing::info!("SHUTDOWN statement executed, stopping new connections");
                    break;
                }
            }
        }

        self.context.registry.disconnect_all();
        let active = self.context.active_connections();
        if active > 0 {
            tracing::info!("Draining {} active connection(s) (timeout: {:?})", active, drain_timeout);
            let deadline = tokio::time::Instant::now() + drain_timeout;
            loop {
                let remaining = self.context.active_connections();
                if remaining == 0 {
                    tracing::info!("All connections drained");
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!("Drain timeout reached with {} connection(s) still active", remaining);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        self.context.stop();
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream) {
        let context = self.context.clone();
        context.connection_opened();
        let slot = ConnectionSlot(context.clone());
        tokio::task::spawn_blocking(move || {
            let _slot = slot;
            match run_blocking(stream, context) {
                Ok(()) => {}
                Err(e) if e.is_canceled() => tracing::debug!("connection ended: {}", e),
                Err(e) => tracing::warn!("connection error: {}", e),
            }
        });
    }
}

/// Releases a counted connection when the worker ends, unwinding included.
struct ConnectionSlot(Arc<ServerContext>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

fn run_blocking(stream: TcpStream, context: Arc<ServerContext>) -> HeronResult<()> {
    let std_stream = stream.into_std()?;
    std_stream.set_nonblocking(false)?;
    std_stream.set_nodelay(true)?;
    let control = std_stream.try_clone()?;
    let mut conn = PgConnection::new(std_stream, context);
    conn.attach_socket(control);
    conn.run()
}
