//! End-to-end tests driving the miner-facing TCP protocol.

use mining_cluster::backend::{AssignedWork, BackendEvents};
use mining_cluster::core::Target;
use mining_cluster::server::Server;
use mining_cluster::store::{Account, Database};
use pretty_assertions::{assert_eq, assert_ne};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Block #125552 in canonical serialization; its nonce solves the header.
const BLOCK_125552: &str = "0100000081cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122bc7f5d74df2b9441a42a14695";

/// The header in the word-swapped order the protocol exchanges.
fn swapped_header() -> Vec<u8> {
    let canonical = hex::decode(BLOCK_125552).unwrap();
    (0..canonical.len()).map(|i| canonical[i ^ 3]).collect()
}

/// Target for the block's bits field (0x1a44b9f2), little-endian hex.
fn block_target_hex() -> String {
    format!("{}f2b944{}", "00".repeat(23), "00".repeat(6))
}

async fn setup(config: &[(&str, &str)]) -> (Arc<Server>, SocketAddr) {
    let db = Database::in_memory().unwrap();
    let mut pairs = vec![("server_port".to_string(), "0".to_string())];
    pairs.extend(
        config
            .iter()
            .map(|(var, value)| (var.to_string(), value.to_string())),
    );
    db.populate(&pairs, "admin", "admin").unwrap();

    let miner = Account::create(&db, "rig1").unwrap();
    miner.set_data("password", Some("pw")).unwrap();

    let server = Server::new(db);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    server.spawn_listener(listener);
    (server, addr)
}

fn assignment(data: Vec<u8>, mask: u8, target: Target) -> AssignedWork {
    AssignedWork { data, mask, target }
}

/// Plain unit with a recognizable previous-hash byte.
fn plain_header(prev_byte: u8) -> Vec<u8> {
    let mut data = vec![0u8; 80];
    data[4] = prev_byte;
    data
}

struct Miner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> String {
        timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed unexpectedly")
    }

    async fn expect_close(&mut self) {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for close")
            .unwrap();
        assert_eq!(line, None, "expected the server to close the connection");
    }

    async fn login(addr: SocketAddr) -> Self {
        let mut miner = Self::connect(addr).await;
        miner.send("LOGIN rig1 pw").await;
        miner
    }

    /// Round-trip a garbage RESULT to prove the connection is still served.
    async fn sync(&mut self) {
        self.send("RESULT zz").await;
        assert_eq!(self.recv().await, "REJECTED :zz");
    }
}

#[tokio::test]
async fn test_login_receives_target_and_work() {
    let (server, addr) = setup(&[("work_mask", "8")]).await;
    let mut miner = Miner::login(addr).await;
    miner.sync().await;

    server.provider().on_work(assignment(
        swapped_header(),
        8,
        Target::from_hex(&block_target_hex()).unwrap(),
    ));

    assert_eq!(
        miner.recv().await,
        format!("TARGET {}", block_target_hex())
    );

    let work_line = miner.recv().await;
    let parts: Vec<&str> = work_line.split(' ').collect();
    assert_eq!(parts[0], "WORK");
    assert_eq!(parts[2], "8");
    // The dispatched header is ours with the low mask bits cleared.
    let dispatched = hex::decode(parts[1]).unwrap();
    assert_eq!(dispatched[..76], swapped_header()[..76]);
}

#[tokio::test]
async fn test_result_accept_and_reject() {
    let (server, addr) = setup(&[("work_mask", "8")]).await;
    let mut miner = Miner::login(addr).await;
    miner.sync().await;

    server.provider().on_work(assignment(
        swapped_header(),
        8,
        Target::from_hex(&block_target_hex()).unwrap(),
    ));
    miner.recv().await; // TARGET
    miner.recv().await; // WORK

    // The real nonce solves the header: accepted.
    let solved = hex::encode(swapped_header());
    miner.send(&format!("RESULT {}", solved)).await;
    assert_eq!(miner.recv().await, format!("ACCEPTED :{}", solved));

    // Flipping the nonce's high bit leaves the reserved sub-range: rejected.
    let mut outside = swapped_header();
    let mut nonce = [0u8; 4];
    nonce.copy_from_slice(&outside[76..]);
    let flipped = u32::from_le_bytes(nonce) ^ 0x8000_0000;
    outside[76..].copy_from_slice(&flipped.to_le_bytes());
    let outside = hex::encode(outside);
    miner.send(&format!("RESULT {}", outside)).await;
    assert_eq!(miner.recv().await, format!("REJECTED :{}", outside));
}

#[tokio::test]
async fn test_login_failure_is_generic() {
    let (_server, addr) = setup(&[]).await;

    // Wrong password and unknown account get the same message.
    for attempt in ["LOGIN rig1 wrong", "LOGIN nobody pw"] {
        let mut miner = Miner::connect(addr).await;
        miner.send(attempt).await;
        assert_eq!(
            miner.recv().await,
            "MSG :ERROR: Login failed. Please check your account details."
        );
        miner.expect_close().await;
    }
}

#[tokio::test]
async fn test_duplicate_login_closes() {
    let (_server, addr) = setup(&[]).await;
    let mut miner = Miner::login(addr).await;
    miner.sync().await;

    miner.send("LOGIN rig1 pw").await;
    assert_eq!(
        miner.recv().await,
        "MSG :ERROR: Received duplicate LOGIN command!"
    );
    miner.expect_close().await;
}

#[tokio::test]
async fn test_unknown_command_and_bad_arity_close() {
    let (_server, addr) = setup(&[]).await;

    let mut miner = Miner::connect(addr).await;
    miner.send("BOGUS something").await;
    assert_eq!(miner.recv().await, "MSG :ERROR: Unknown command!");
    miner.expect_close().await;

    let mut miner = Miner::connect(addr).await;
    miner.send("LOGIN just-a-username").await;
    assert_eq!(miner.recv().await, "MSG :ERROR: Invalid LOGIN command!");
    miner.expect_close().await;
}

#[tokio::test]
async fn test_clone_limit_closes_second_connection() {
    let (_server, addr) = setup(&[("max_clones", "1")]).await;

    let mut first = Miner::login(addr).await;
    first.sync().await;

    let mut second = Miner::connect(addr).await;
    second.send("LOGIN rig1 pw").await;
    assert_eq!(
        second.recv().await,
        "MSG :ERROR: Connection limit exceeded!"
    );
    second.expect_close().await;

    // The first connection is unaffected.
    first.sync().await;
}

#[tokio::test]
async fn test_block_announcements() {
    let (server, addr) = setup(&[]).await;

    // Connections hear about new blocks even before logging in.
    let mut early = Miner::connect(addr).await;
    // Make sure the connection is registered before broadcasting.
    early.send("META client test").await;
    early.send("RESULT zz").await; // ignored pre-auth: no reply
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.provider().on_block(143001);
    assert_eq!(early.recv().await, "BLOCK 143001");

    // A later login is told the height right away.
    let mut late = Miner::login(addr).await;
    assert_eq!(late.recv().await, "BLOCK 143001");
}

#[tokio::test]
async fn test_template_change_invalidates_held_work() {
    let (server, addr) = setup(&[("work_mask", "8")]).await;
    let mut miner = Miner::login(addr).await;
    miner.sync().await;

    server
        .provider()
        .on_work(assignment(plain_header(1), 8, Target::max()));
    miner.recv().await; // TARGET
    let work_line = miner.recv().await;
    let old_work = work_line.split(' ').nth(1).unwrap().to_string();

    // Any nonce in range solves against the all-ones target.
    miner.send(&format!("RESULT {}", old_work)).await;
    assert_eq!(miner.recv().await, format!("ACCEPTED :{}", old_work));

    // A dissimilar template arrives: the server pushes fresh work with the
    // new target, and the stale unit stops being accepted.
    server.provider().on_work(assignment(
        plain_header(2),
        8,
        Target::from_bytes([0xfe; 32]),
    ));
    assert_eq!(
        miner.recv().await,
        format!("TARGET {}", "fe".repeat(32))
    );
    let new_line = miner.recv().await;
    assert!(new_line.starts_with("WORK "));
    assert_ne!(new_line.split(' ').nth(1).unwrap(), old_work);

    miner.send(&format!("RESULT {}", old_work)).await;
    assert_eq!(miner.recv().await, format!("REJECTED :{}", old_work));
}

#[tokio::test]
async fn test_more_dispatches_additional_work() {
    let (server, addr) = setup(&[("work_mask", "8")]).await;
    let mut miner = Miner::login(addr).await;
    miner.sync().await;

    server
        .provider()
        .on_work(assignment(plain_header(1), 10, Target::max()));
    miner.recv().await; // TARGET
    let first = miner.recv().await;

    miner.send("MORE").await;
    let second = miner.recv().await;
    assert!(second.starts_with("WORK "));
    // Distinct nonce sub-ranges of the same template.
    assert_ne!(first, second);
}
