//! A scripted in-process worker speaking the wire protocol over localhost,
//! used to drive a real manager through its network loop.

// Each integration suite compiles its own copy; not every suite uses
// every helper.
#![allow(dead_code)]

use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const PROTOCOL: u32 = 11;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// One commit observed by the worker: staging directives plus the task
/// description block.
#[derive(Debug, Default, Clone)]
pub struct TaskCommit {
    pub task_id: u64,
    pub command: String,
    pub category: String,
    pub cores: i64,
    pub memory: i64,
    pub disk: i64,
    pub gpus: i64,
    /// Full `puturl` lines, in arrival order.
    pub puturls: Vec<String>,
    /// `put` directives as (cache-name, size).
    pub puts: Vec<(String, u64)>,
    pub infiles: Vec<String>,
    pub outfiles: Vec<String>,
}

/// Install a test tracing subscriber once; `RUST_LOG`-style filtering is
/// not needed, failures already carry the relevant context.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub struct FakeWorker {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeWorker {
    pub async fn connect(port: u16) -> anyhow::Result<FakeWorker> {
        init_tracing();
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .context("connect to manager")?;
        let (read, writer) = stream.into_split();
        Ok(FakeWorker {
            reader: BufReader::new(read),
            writer,
        })
    }

    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .context("send line")
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(bytes).await.context("send payload")
    }

    pub async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        let n = timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("read timed out")??;
        if n == 0 {
            bail!("manager closed the connection");
        }
        Ok(line.trim_end().to_string())
    }

    pub async fn read_exact(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        timeout(IO_TIMEOUT, self.reader.read_exact(&mut buf))
            .await
            .context("payload read timed out")??;
        Ok(buf)
    }

    /// Send the handshake and consume the manager's acknowledgement.
    pub async fn handshake(&mut self, hostname: &str) -> anyhow::Result<()> {
        self.send(&format!(
            "taskvine {PROTOCOL} {hostname} linux x86_64 9.0.0"
        ))
        .await?;
        let ack = self.read_line().await?;
        if !ack.starts_with("taskvine ") {
            bail!("unexpected handshake ack: {ack:?}");
        }
        Ok(())
    }

    /// Report one worker slot with the given capacities.
    pub async fn declare_resources(
        &mut self,
        cores: i64,
        memory: i64,
        disk: i64,
        gpus: i64,
    ) -> anyhow::Result<()> {
        self.send(&format!("resource cores {cores} {cores} {cores}")).await?;
        self.send(&format!("resource memory {memory} {memory} {memory}")).await?;
        self.send(&format!("resource disk {disk} {disk} {disk}")).await?;
        self.send(&format!("resource gpus {gpus} {gpus} {gpus}")).await?;
        self.send("resource workers 1 1 1").await?;
        self.send("info end_of_resource_update 1").await?;
        Ok(())
    }

    pub async fn announce_transfer_address(&mut self, host: &str, port: u16) -> anyhow::Result<()> {
        self.send(&format!("transfer-address {host} {port}")).await
    }

    /// Read directives until a full task description has arrived.
    /// Keepalive checks are answered along the way.
    pub async fn expect_task(&mut self) -> anyhow::Result<TaskCommit> {
        let mut commit = TaskCommit::default();
        loop {
            let line = self.read_line().await?;
            let mut parts = line.split_ascii_whitespace();
            match parts.next().unwrap_or("") {
                "check" => self.send("alive").await?,
                "put" => {
                    let name = parts.next().context("put name")?.to_string();
                    let size: usize = parts.next().context("put size")?.parse()?;
                    let _payload = self.read_exact(size).await?;
                    commit.puts.push((name, size as u64));
                }
                "puturl" => commit.puturls.push(line),
                "mini_task" => {
                    let spec_len: usize = parts.nth(3).context("mini_task spec len")?.parse()?;
                    let _spec = self.read_exact(spec_len).await?;
                }
                "task" => {
                    commit.task_id = parts.next().context("task id")?.parse()?;
                    self.read_task_block(&mut commit).await?;
                    return Ok(commit);
                }
                "unlink" => {}
                other => bail!("unexpected directive before task: {other:?} in {line:?}"),
            }
        }
    }

    async fn read_task_block(&mut self, commit: &mut TaskCommit) -> anyhow::Result<()> {
        loop {
            let line = self.read_line().await?;
            let mut parts = line.split_ascii_whitespace();
            match parts.next().unwrap_or("") {
                "cmd" => {
                    let len: usize = parts.next().context("cmd len")?.parse()?;
                    let bytes = self.read_exact(len).await?;
                    commit.command = String::from_utf8_lossy(&bytes).into_owned();
                    // Payloads are newline-terminated on the wire.
                    let _ = self.read_line().await?;
                }
                "env" => {
                    let len: usize = parts.next().context("env len")?.parse()?;
                    let _ = self.read_exact(len).await?;
                    let _ = self.read_line().await?;
                }
                "category" => commit.category = parts.next().unwrap_or("").to_string(),
                "cores" => commit.cores = parts.next().context("cores")?.parse()?,
                "memory" => commit.memory = parts.next().context("memory")?.parse()?,
                "disk" => commit.disk = parts.next().context("disk")?.parse()?,
                "gpus" => commit.gpus = parts.next().context("gpus")?.parse()?,
                "end_time" | "wall_time" => {}
                "infile" => commit.infiles.push(line.clone()),
                "outfile" => commit.outfiles.push(line.clone()),
                "end" => return Ok(()),
                other => bail!("unexpected line in task block: {other:?}"),
            }
        }
    }

    /// Announce a queued result and stream it back once the manager asks.
    pub async fn offer_result(
        &mut self,
        task_id: u64,
        status: i32,
        exit: i32,
        execute_usec: u64,
        stdout: &[u8],
    ) -> anyhow::Result<()> {
        self.send("available_results").await?;
        loop {
            let line = self.read_line().await?;
            if line.starts_with("send_results") {
                break;
            }
            if line == "check" {
                self.send("alive").await?;
            }
            // Other traffic (unlinks etc.) is irrelevant here.
        }
        self.send(&format!(
            "result {status} {exit} {} {execute_usec} {task_id}",
            stdout.len()
        ))
        .await?;
        self.send_raw(stdout).await?;
        self.send("end").await
    }

    /// Answer `get` requests with the given content until one has been
    /// served; unlinks and keepalives are absorbed.
    pub async fn serve_one_get(&mut self, contents: &[u8]) -> anyhow::Result<String> {
        loop {
            let line = self.read_line().await?;
            let mut parts = line.split_ascii_whitespace();
            match parts.next().unwrap_or("") {
                "get" => {
                    let cache_name = parts.next().context("get cache name")?.to_string();
                    self.send(&format!("file {cache_name} {}", contents.len()))
                        .await?;
                    self.send_raw(contents).await?;
                    return Ok(cache_name);
                }
                "unlink" => {}
                "check" => self.send("alive").await?,
                "release" | "exit" => bail!("released while waiting for get"),
                other => bail!("unexpected line while serving get: {other:?}"),
            }
        }
    }

    /// Absorb trailing traffic (unlinks, keepalives) until the manager
    /// releases the worker or the test drops the connection.
    pub async fn drain(&mut self) {
        loop {
            let Ok(line) = self.read_line().await else { return };
            if line == "check" {
                let _ = self.send("alive").await;
            }
            if line == "release" || line == "exit" {
                return;
            }
        }
    }
}

/// A worker that connects, handshakes and declares resources in one call.
pub async fn ready_worker(
    port: u16,
    hostname: &str,
    cores: i64,
    memory: i64,
    disk: i64,
) -> anyhow::Result<FakeWorker> {
    let mut w = FakeWorker::connect(port).await?;
    w.handshake(hostname).await?;
    w.declare_resources(cores, memory, disk, 0).await?;
    Ok(w)
}
