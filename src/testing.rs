use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};

use crate::command::TelloCommand;
use crate::errors::Result;
use crate::options::TelloOptions;
use crate::tello::CommandLink;

/// Shows library logs in test output, once per test binary.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Loopback stand-in for the drone: records every datagram and answers
/// "ok", or its height reading to a height query.
pub(crate) struct FakeDrone {
    pub address: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
}

impl FakeDrone {
    pub async fn start() -> Self {
        Self::start_at_height("9dm").await
    }

    /// `height` is the raw reply to `height?`, e.g. "9dm".
    pub async fn start_at_height(height: &'static str) -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = sock.local_addr().unwrap();
        let (tx, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = vec![0; 256];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else { break };
                let msg = String::from_utf8_lossy(&buf[..n]).to_string();
                let reply: &[u8] = match msg.as_str() {
                    "height?" => {
                        // garbage first, the receiver must survive it
                        let _ = sock.send_to(&[0xff, 0xfe, 0x00], peer).await;
                        height.as_bytes()
                    }
                    _ => b"ok",
                };
                let _ = sock.send_to(reply, peer).await;
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });

        Self { address, received }
    }

    pub fn options(&self) -> TelloOptions {
        let mut options = TelloOptions::default();
        options.drone_host = self.address.ip().to_string();
        options.control_port = self.address.port();
        options.local_address = "127.0.0.1:0".to_string();
        options.video_address = "127.0.0.1:0".to_string();
        options.timing.mode_entry_settle = Duration::from_millis(500);
        options.timing.query_timeout = Duration::from_millis(500);
        options
    }

    pub async fn next(&mut self, within: Duration) -> Option<String> {
        timeout(within, self.received.recv()).await.ok().flatten()
    }

    /// Everything received until the link goes quiet for `quiet`.
    pub async fn drain(&mut self, quiet: Duration) -> Vec<String> {
        let mut all = vec![];
        while let Some(msg) = self.next(quiet).await {
            all.push(msg);
        }
        all
    }
}

/// Records commands with the instant they were issued.
#[derive(Default)]
pub(crate) struct RecordingLink {
    sent: Mutex<Vec<(Instant, TelloCommand)>>,
}

impl RecordingLink {
    pub fn sent(&self) -> Vec<(Instant, TelloCommand)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<TelloCommand> {
        self.sent().into_iter().map(|(_, c)| c).collect()
    }

    pub fn count(&self, command: &TelloCommand) -> usize {
        self.sent().iter().filter(|(_, c)| c == command).count()
    }
}

impl CommandLink for RecordingLink {
    async fn send(&self, command: &TelloCommand) -> Result<()> {
        self.sent.lock().unwrap().push((Instant::now(), command.clone()));
        Ok(())
    }
}
