//! Per-miner connection handling.

use crate::core::{Target, WorkUnit};
use crate::error::Result;
use crate::server::protocol::{parse_line, Frame};
use crate::server::registry::{ConnectionHandle, Event};
use crate::server::Server;
use crate::store::Account;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Serve one miner connection until it closes.
///
/// The connection is enrolled in the registry for its whole lifetime; all
/// outside interaction (work refreshes, block announcements, admin
/// messages, kicks) arrives through the handle's event channel.
pub async fn serve(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let session_id = server.next_session();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let handle = Arc::new(ConnectionHandle::new(session_id, peer, events_tx));
    server.registry().insert(Arc::clone(&handle));
    info!("miner connected from {} (session {})", peer, session_id);

    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut connection = WorkerConnection {
        server: Arc::clone(&server),
        handle,
        writer: write_half,
        account: None,
        work: Vec::new(),
        sent_target: None,
        sending_work: false,
        closing: false,
    };

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if connection.handle_line(&line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        if connection.handle_event(event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        if connection.closing {
            // Push out anything still buffered before dropping the socket.
            let _ = connection.writer.flush().await;
            break;
        }
    }

    server.registry().remove(session_id);
    info!("miner at {} disconnected (session {})", peer, session_id);
}

struct WorkerConnection {
    server: Arc<Server>,
    handle: Arc<ConnectionHandle>,
    writer: OwnedWriteHalf,
    account: Option<Account>,
    /// Units currently checked out to this miner
    work: Vec<WorkUnit>,
    sent_target: Option<Target>,
    sending_work: bool,
    closing: bool,
}

impl WorkerConnection {
    async fn handle_line(&mut self, line: &str) -> Result<()> {
        let Some((command, args)) = parse_line(line) else {
            return Ok(());
        };

        match (command.as_str(), args.len()) {
            ("LOGIN", 2) => self.cmd_login(&args[0], &args[1]).await,
            ("META", 2) => self.cmd_meta(&args[0], &args[1]),
            ("MORE", 0) => {
                self.cmd_more();
                Ok(())
            }
            ("RESULT", 1) => self.cmd_result(&args[0]).await,
            ("LOGIN", _) | ("META", _) | ("MORE", _) | ("RESULT", _) => {
                self.kick(Some(&format!("Invalid {} command!", command))).await
            }
            _ => self.kick(Some("Unknown command!")).await,
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::SendWork => {
                self.send_work();
                Ok(())
            }
            Event::SendBlock => self.send_block().await,
            Event::Msg(text) => self.send_msg(&text).await,
            Event::Kick(reason) => self.kick(reason.as_deref()).await,
            Event::WorkReady(unit) => self.work_arrived(unit).await,
        }
    }

    async fn send_line(&mut self, frame: &Frame) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", frame).as_bytes())
            .await?;
        Ok(())
    }

    async fn send_msg(&mut self, text: &str) -> Result<()> {
        self.send_line(&Frame::Msg(text.to_string())).await
    }

    /// Disconnect the miner, with an optional reason shown on its console.
    async fn kick(&mut self, reason: Option<&str>) -> Result<()> {
        if let Some(reason) = reason {
            self.send_msg(&format!("ERROR: {}", reason)).await?;
        }
        self.closing = true;
        Ok(())
    }

    async fn send_block(&mut self) -> Result<()> {
        if let Some(height) = self.server.provider().block() {
            self.send_line(&Frame::Block(height)).await?;
        }
        Ok(())
    }

    /// Request a unit from the provider for this miner, unless one is
    /// already on its way. The unit is delivered back to this connection's
    /// event queue, so a slow provider never stalls command handling.
    fn send_work(&mut self) {
        if self.sending_work {
            return;
        }
        let Some(account) = &self.account else {
            return;
        };

        self.sending_work = true;
        let rx = self.server.provider().get_work(account.work_mask());
        let handle = Arc::clone(&self.handle);
        tokio::spawn(async move {
            if let Ok(unit) = rx.await {
                handle.send(Event::WorkReady(unit));
            }
        });
    }

    async fn work_arrived(&mut self, unit: WorkUnit) -> Result<()> {
        self.sending_work = false;

        // A dissimilar unit means the template moved on; everything the
        // miner still holds belongs to a dead block.
        if self
            .work
            .first()
            .is_some_and(|held| !held.is_similar_to(&unit))
        {
            self.work.clear();
        }

        let target = *unit.target();
        let work_hex = unit.to_hex();
        let mask = unit.mask();
        self.work.push(unit);

        if self.sent_target != Some(target) {
            self.send_line(&Frame::Target(target.to_hex())).await?;
            self.sent_target = Some(target);
        }
        self.send_line(&Frame::Work(work_hex, mask)).await
    }

    async fn cmd_login(&mut self, username: &str, password: &str) -> Result<()> {
        if self.account.is_some() {
            return self.kick(Some("Received duplicate LOGIN command!")).await;
        }

        let account = match Account::lookup(self.server.db(), username) {
            Ok(account) => account,
            Err(e) => {
                warn!("account lookup failed: {}", e);
                None
            }
        };
        // One generic message for both unknown accounts and bad passwords.
        let account = match account {
            Some(account) if account.check_password(password) => account,
            _ => {
                return self
                    .kick(Some("Login failed. Please check your account details."))
                    .await
            }
        };

        self.handle.set_username(account.username());
        self.account = Some(account);

        if !self.check_clones() {
            return self.kick(Some("Connection limit exceeded!")).await;
        }

        if let Some(motd) = self.read_motd() {
            for line in motd.lines() {
                self.send_msg(line).await?;
            }
        }
        self.send_block().await?;
        self.send_work();
        Ok(())
    }

    /// False when logging in pushes the account over its connection limit.
    /// The current connection is already registered under the username, so
    /// the count includes it.
    fn check_clones(&self) -> bool {
        let Some(account) = &self.account else {
            return true;
        };
        let Some(limit) = account.get_config_opt::<usize>("max_clones") else {
            return true;
        };
        self.server
            .registry()
            .list_account(account.username())
            .len()
            <= limit
    }

    /// The MOTD configuration variable names a file to read at login time.
    fn read_motd(&self) -> Option<String> {
        let account = self.account.as_ref()?;
        let path: String = account.get_config_opt("motd")?;
        std::fs::read_to_string(path).ok()
    }

    fn cmd_meta(&mut self, var: &str, value: &str) -> Result<()> {
        if self.account.is_some() {
            self.handle.set_meta(var, value);
        }
        Ok(())
    }

    fn cmd_more(&mut self) {
        if self.account.is_some() {
            self.send_work();
        }
    }

    async fn cmd_result(&mut self, hex_str: &str) -> Result<()> {
        if self.account.is_none() {
            return Ok(());
        }

        // Stale or corrupt submissions are routine; reject without closing.
        let decoded = hex::decode(hex_str).ok();
        match decoded {
            Some(result) if self.work.iter().any(|unit| unit.check_result(&result)) => {
                self.server.provider().send_result(result);
                self.send_line(&Frame::Accepted(hex_str.to_string())).await
            }
            _ => self.send_line(&Frame::Rejected(hex_str.to_string())).await,
        }
    }
}
