//! Upstream client for another cluster server.
//!
//! Speaks the miner-facing line protocol from the other side: it logs in,
//! consumes WORK/TARGET/BLOCK/MSG frames into the backend callbacks, and
//! pushes MORE and RESULT lines upstream.

use super::{AssignedWork, Backend, BackendEvents, BackendUrl};
use crate::core::Target;
use crate::error::Result;
use crate::server::protocol::parse_line;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Backend client for an upstream server speaking the miner protocol.
pub struct MmpBackend {
    url: BackendUrl,
    version: &'static str,
    out: mpsc::UnboundedSender<String>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MmpBackend {
    /// Create a client; it does nothing until [`MmpBackend::spawn`].
    pub fn new(url: BackendUrl, version: &'static str) -> Arc<Self> {
        let (out, out_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            url,
            version,
            out,
            out_rx: Mutex::new(Some(out_rx)),
        })
    }

    /// Start the connection loop, reporting into the given handler.
    pub fn spawn(self: &Arc<Self>, events: Arc<dyn BackendEvents>) {
        let client = Arc::clone(self);
        let Some(out_rx) = client.out_rx.lock().take() else {
            warn!("upstream client already started");
            return;
        };
        tokio::spawn(async move { client.run(out_rx, events).await });
    }

    async fn run(
        self: Arc<Self>,
        mut out_rx: mpsc::UnboundedReceiver<String>,
        events: Arc<dyn BackendEvents>,
    ) {
        loop {
            match TcpStream::connect((self.url.host.as_str(), self.url.port)).await {
                Ok(stream) => {
                    events.on_connect();
                    if let Err(e) = self.session(stream, &mut out_rx, &events).await {
                        warn!("upstream session error: {}", e);
                    }
                    events.on_disconnect();
                }
                Err(e) => {
                    warn!("cannot reach upstream server: {}", e);
                    events.on_failure();
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn session(
        &self,
        stream: TcpStream,
        out_rx: &mut mpsc::UnboundedReceiver<String>,
        events: &Arc<dyn BackendEvents>,
    ) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();

        let login = format!(
            "LOGIN {} {}\nMETA version {}\n",
            self.url.username, self.url.password, self.version
        );
        write_half.write_all(login.as_bytes()).await?;

        let mut lines = BufReader::new(read_half).lines();
        // WORK frames inherit the most recent TARGET.
        let mut target: Option<Target> = None;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => self.handle_frame(&line, &mut target, events),
                        None => return Ok(()),
                    }
                }
                command = out_rx.recv() => {
                    match command {
                        Some(command) => {
                            write_half.write_all(format!("{}\n", command).as_bytes()).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_frame(
        &self,
        line: &str,
        target: &mut Option<Target>,
        events: &Arc<dyn BackendEvents>,
    ) {
        let Some((command, args)) = parse_line(line) else {
            return;
        };

        match (command.as_str(), args.as_slice()) {
            ("WORK", [data_hex, mask_str]) => {
                let Ok(data) = hex::decode(data_hex) else {
                    warn!("upstream sent undecodable work");
                    return;
                };
                let Ok(mask) = mask_str.parse::<u8>() else {
                    warn!("upstream sent bad work mask: {}", mask_str);
                    return;
                };
                let Some(target) = *target else {
                    warn!("upstream sent work before any target, dropping");
                    return;
                };
                events.on_work(AssignedWork { data, mask, target });
            }
            ("TARGET", [hex]) => match Target::from_hex(hex) {
                Ok(parsed) => *target = Some(parsed),
                Err(e) => warn!("upstream sent bad target: {}", e),
            },
            ("BLOCK", [height]) => match height.parse() {
                Ok(height) => events.on_block(height),
                Err(_) => warn!("upstream sent bad block height: {}", height),
            },
            ("MSG", [text]) => events.on_message(text),
            ("ACCEPTED", _) => debug!("upstream accepted a result"),
            ("REJECTED", _) => warn!("upstream rejected a result"),
            _ => debug!("ignoring upstream frame: {}", line),
        }
    }
}

#[async_trait::async_trait]
impl Backend for MmpBackend {
    fn request_work(&self) {
        let _ = self.out.send("MORE".to_string());
    }

    async fn submit(&self, result: &[u8]) -> Result<bool> {
        // Acceptance comes back asynchronously as an ACCEPTED/REJECTED
        // frame; delivery onto the wire is the best answer available here.
        let delivered = self
            .out
            .send(format!("RESULT {}", hex::encode(result)))
            .is_ok();
        Ok(delivered)
    }
}
