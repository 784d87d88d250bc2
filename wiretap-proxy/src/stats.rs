use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::pool::{ConnectionPool, PoolStats};

#[derive(Debug, Default)]
pub struct ProxyStats {
    current_connections: AtomicU64,
    total_connections: AtomicU64,
    total_exchanges: AtomicU64,
    failed_exchanges: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub current_connections: u64,
    pub total_connections: u64,
    pub total_exchanges: u64,
    pub failed_exchanges: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatisticsReport {
    #[serde(flatten)]
    pub proxy: StatsSnapshot,
    pub history_records: usize,
    pub pool: PoolStats,
}

/// Counts a client connection as open until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ProxyStats>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.current_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn exchange_finished(&self, ok: bool) {
        self.total_exchanges.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_exchanges.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn current_connections(&self) -> u64 {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            current_connections: self.current_connections(),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_exchanges: self.total_exchanges.load(Ordering::Relaxed),
            failed_exchanges: self.failed_exchanges.load(Ordering::Relaxed),
        }
    }
}

/// Emits one statistics line per tick. Runs until the task is aborted.
pub(crate) async fn log_periodically(
    stats: Arc<ProxyStats>,
    pool: Arc<ConnectionPool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let snapshot = stats.snapshot();
        let pool = pool.stats().await;
        info!(
            current_connections = snapshot.current_connections,
            total_connections = snapshot.total_connections,
            total_exchanges = snapshot.total_exchanges,
            failed_exchanges = snapshot.failed_exchanges,
            pool_dialed = pool.dialed,
            pool_idle = pool.idle,
            pool_running = pool.running,
            "proxy statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use wiretap_net::Limits;

    use super::{ProxyStats, log_periodically};
    use crate::config::PoolConfig;
    use crate::pool::ConnectionPool;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn statistics_line_is_logged_every_tick_even_when_idle() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let stats = Arc::new(ProxyStats::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), Limits::default()).unwrap());
        let _ = tokio::time::timeout(
            Duration::from_millis(120),
            log_periodically(stats, pool, Duration::from_millis(20)),
        )
        .await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.matches("proxy statistics").count() >= 3, "{output}");
    }

    #[test]
    fn guard_tracks_open_connections() {
        let stats = Arc::new(ProxyStats::new());
        let first = stats.connection_opened();
        let second = stats.connection_opened();
        assert_eq!(stats.current_connections(), 2);
        drop(first);
        assert_eq!(stats.current_connections(), 1);
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.current_connections, 0);
        assert_eq!(snapshot.total_connections, 2);
    }

    #[test]
    fn failed_exchanges_are_counted_separately() {
        let stats = ProxyStats::new();
        stats.exchange_finished(true);
        stats.exchange_finished(false);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_exchanges, 2);
        assert_eq!(snapshot.failed_exchanges, 1);
    }
}
