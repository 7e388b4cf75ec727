//! Connection handler for individual device connections.
//!
//! Each accepted connection gets its own `ConnectionHandler` that:
//! - Reads one command per message (no framing beyond the read boundary)
//! - Replies with a reading for known commands and `"0"` otherwise
//! - Ends on EOF or any transport error without affecting other connections
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in a graceful close

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use fleet_core::DeviceName;
use fleet_protocol::{CommandSet, MAX_COMMAND_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection handler for a single device client.
pub struct ConnectionHandler {
    stream: TcpStream,

    peer: SocketAddr,

    /// Device this connection was accepted for
    device: DeviceName,

    /// Command vocabulary captured at accept time
    commands: CommandSet,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, peer: SocketAddr, device: DeviceName, commands: CommandSet) -> Self {
        Self {
            stream,
            peer,
            device,
            commands,
        }
    }

    /// Runs the request/response loop until the peer goes away.
    ///
    /// Returns the number of commands answered. The socket is closed when
    /// the handler is dropped at the end of this call.
    pub async fn run(mut self) -> u64 {
        debug!(device = %self.device, peer = %self.peer, "Client connected");

        let mut answered = 0;
        let result = self.serve(&mut answered).await;

        match result {
            Ok(()) => debug!(
                device = %self.device,
                peer = %self.peer,
                answered,
                "Client disconnected"
            ),
            Err(e) => debug!(
                device = %self.device,
                peer = %self.peer,
                answered,
                error = %e,
                "Connection closed"
            ),
        }

        answered
    }

    async fn serve(&mut self, answered: &mut u64) -> Result<(), ConnectionError> {
        let mut buf = [0u8; MAX_COMMAND_SIZE];

        loop {
            let n = match self.stream.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if is_reset(e.kind()) => return Ok(()),
                Err(e) => return Err(ConnectionError::Io(e.to_string())),
            };

            let Some(message) = buf.get(..n) else {
                return Err(ConnectionError::Io(format!("read length {n} out of bounds")));
            };

            let reply = self.commands.reply(message);
            trace!(device = %self.device, bytes = n, reply = %reply, "Answering command");

            match timeout(WRITE_TIMEOUT, self.stream.write_all(reply.as_bytes())).await {
                Ok(Ok(())) => *answered += 1,
                Ok(Err(e)) if is_reset(e.kind()) => return Ok(()),
                Ok(Err(e)) => return Err(ConnectionError::Io(e.to_string())),
                Err(_) => return Err(ConnectionError::WriteTimeout),
            }
        }
    }
}

/// Peer-initiated teardown is a normal end of conversation.
fn is_reset(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

/// Errors that can end a device connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Write timeout")]
    WriteTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_handler(commands: &[&str]) -> (TcpStream, tokio::task::JoinHandle<u64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let owned: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        let set = CommandSet::new(&owned);

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            ConnectionHandler::new(stream, peer, DeviceName::new("D1"), set)
                .run()
                .await
        });

        let client = TcpStream::connect(addr).await.unwrap();
        (client, server)
    }

    async fn ask(client: &mut TcpStream, command: &str) -> String {
        client.write_all(command.as_bytes()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_answers_until_eof() {
        let (mut client, server) = spawn_handler(&["STATUS"]).await;

        let reading: u32 = ask(&mut client, "STATUS").await.parse().unwrap();
        assert!((1..=100).contains(&reading));
        assert_eq!(ask(&mut client, "PING").await, "0");

        drop(client);
        let answered = server.await.unwrap();
        assert_eq!(answered, 2);
    }

    #[test]
    fn test_reset_kinds() {
        assert!(is_reset(ErrorKind::ConnectionReset));
        assert!(is_reset(ErrorKind::BrokenPipe));
        assert!(!is_reset(ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_connection_error_display() {
        assert_eq!(ConnectionError::WriteTimeout.to_string(), "Write timeout");
        assert!(ConnectionError::Io("boom".to_string()).to_string().contains("boom"));
    }
}
