//! TCP server for the prefixed line echo protocol.
//!
//! Binds the listener, starts the stats reporter, and hands every accepted
//! connection to its own task.

use crate::config::Config;
use crate::protocol::handle_connection;
use crate::stats::{self, Stats};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so persistent errors (EMFILE) don't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    stats: Arc<Stats>,
    connection_limit: Option<Arc<Semaphore>>,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: Config) -> Result<Self, ServerError> {
        let listener = create_listener(config.listen, config.backlog)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(config.listen, e))?;

        let connection_limit = config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        Ok(Server {
            config,
            listener,
            stats: Stats::new(),
            connection_limit,
        })
    }

    /// Address the listener is actually bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Counters shared with every connection
    #[cfg(test)]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Start the stats reporter and accept connections forever
    pub async fn run(self) {
        let address = self.local_addr().unwrap_or(self.config.listen);
        info!(%address, prefix = %self.config.prefix, "Server listening");

        tokio::spawn(stats::report_task(
            Arc::clone(&self.stats),
            self.config.stats_interval,
        ));

        let prefix: Arc<str> = Arc::from(self.config.prefix.as_str());

        loop {
            // Wait for a connection slot when a limit is configured
            let permit = match &self.connection_limit {
                Some(limit) => Arc::clone(limit).acquire_owned().await.ok(),
                None => None,
            };

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let prefix = Arc::clone(&prefix);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, prefix, stats).await {
                            warn!(peer = %addr, error = %e, "Connection error");
                        }
                        debug!(peer = %addr, "Connection closed");
                        drop(permit);
                    });
                }
                Err(e) => accept_failed(&e).await,
            }
        }
    }
}

/// Log a failed accept and back off briefly before the next attempt
async fn accept_failed(e: &io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

/// Create a TCP listener with SO_REUSEADDR and the given backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

/// Server startup errors
#[derive(Debug)]
pub enum ServerError {
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind to {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};

    fn test_config(prefix: &str) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            prefix: prefix.to_string(),
            workers: None,
            max_connections: None,
            backlog: 128,
            // Long enough that the reporter never resets counters mid-test
            stats_interval: Duration::from_secs(3600),
            log_level: "info".to_string(),
        }
    }

    async fn start(config: Config) -> (SocketAddr, Arc<Stats>) {
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = Arc::clone(server.stats());
        tokio::spawn(server.run());
        (addr, stats)
    }

    async fn wait_for_connections(stats: &Stats, expected: u64) {
        timeout(Duration::from_secs(5), async {
            while stats.connections() != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {expected} connections, have {}",
                stats.connections()
            )
        });
    }

    async fn expect_response(stream: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_prefix_scenario() {
        let (addr, stats) = start(test_config("LOG:")).await;
        let before = stats.connections();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"hello\n").await.unwrap();
        expect_response(&mut client, b"LOG: hello\n").await;
        client.write_all(b"world\n").await.unwrap();
        expect_response(&mut client, b"LOG: world\n").await;

        assert_eq!(stats.connections(), before + 1);
        drop(client);
        wait_for_connections(&stats, before).await;
    }

    #[tokio::test]
    async fn test_lines_answered_in_order() {
        let (addr, stats) = start(test_config("#")).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let mut expected = Vec::new();
        for i in 0..20 {
            client.write_all(format!("msg {i}\n").as_bytes()).await.unwrap();
            expected.extend_from_slice(format!("# msg {i}\n").as_bytes());
        }
        expect_response(&mut client, &expected).await;
        assert_eq!(stats.sample().lines, 20);
    }

    #[tokio::test]
    async fn test_connection_count() {
        let (addr, stats) = start(test_config("P")).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        wait_for_connections(&stats, 3).await;

        clients.pop();
        wait_for_connections(&stats, 2).await;

        clients.clear();
        wait_for_connections(&stats, 0).await;
    }

    #[tokio::test]
    async fn test_partial_line_dropped_on_close() {
        let (addr, stats) = start(test_config("LOG:")).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"done\nunfinished").await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut output))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(output, b"LOG: done\n");
        wait_for_connections(&stats, 0).await;
        assert_eq!(stats.sample().lines, 1);
    }

    #[tokio::test]
    async fn test_clients_do_not_mix() {
        let (addr, stats) = start(test_config("LOG:")).await;

        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        for i in 0..5 {
            a.write_all(format!("a{i}\n").as_bytes()).await.unwrap();
            b.write_all(format!("b{i}\n").as_bytes()).await.unwrap();
        }

        let expected_a: Vec<u8> = (0..5)
            .flat_map(|i| format!("LOG: a{i}\n").into_bytes())
            .collect();
        let expected_b: Vec<u8> = (0..5)
            .flat_map(|i| format!("LOG: b{i}\n").into_bytes())
            .collect();

        expect_response(&mut a, &expected_a).await;
        expect_response(&mut b, &expected_b).await;
        assert_eq!(stats.sample().lines, 10);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = test_config("P");
        config.max_connections = Some(1);
        let (addr, stats) = start(config).await;

        let first = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&stats, 1).await;

        // Completes the TCP handshake in the backlog but is not served yet
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"waiting\n").await.unwrap();

        let mut buf = [0u8; 1];
        assert!(timeout(Duration::from_millis(200), second.read(&mut buf))
            .await
            .is_err());

        drop(first);
        expect_response(&mut second, b"P waiting\n").await;
    }

    #[tokio::test]
    async fn test_bind_error() {
        let (addr, _) = start(test_config("P")).await;

        let mut config = test_config("P");
        config.listen = addr;
        match Server::bind(config) {
            Err(ServerError::Bind(failed, _)) => assert_eq!(failed, addr),
            Ok(_) => panic!("second bind to {addr} should fail"),
        }
    }

    #[tokio::test]
    async fn test_reset_connection_released() {
        let (addr, stats) = start(test_config("P")).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"a\n").await.unwrap();
        expect_response(&mut client, b"P a\n").await;
        wait_for_connections(&stats, 1).await;

        // Zero linger turns the close into an RST
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        wait_for_connections(&stats, 0).await;

        // Other clients are unaffected
        let mut other = TcpStream::connect(addr).await.unwrap();
        other.write_all(b"b\n").await.unwrap();
        expect_response(&mut other, b"P b\n").await;
    }

    #[tokio::test]
    async fn test_accept_failure_backs_off() {
        let err = io::Error::new(io::ErrorKind::Other, "too many open files");
        let started = tokio::time::Instant::now();
        accept_failed(&err).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }
}
