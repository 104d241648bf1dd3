use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use chrono::Local;
use thiserror::Error;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    error::ErrorCode,
    message::ChatMessage,
    protocol::{Call, Reply, Request, Response, read_message, write_message},
};

const ANONYMOUS: &str = "anonymous";

/// An error reported by the hub rather than by the connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Calls the hub over one TCP connection. Calls may overlap: replies are
/// routed back to their caller by sequence number.
pub struct RpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_seq: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl RpcClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        info!("connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let pending = Pending::default();
        let reader_task =
            tokio::spawn(route_replies(BufReader::new(reader), Arc::clone(&pending)));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            next_seq: AtomicU64::new(1),
            reader_task,
        })
    }

    pub async fn join(&self, id: &str) -> Result<()> {
        let reply = self.call(Call::Join { id: id.to_string() }).await?;
        expect_ok(reply)
    }

    pub async fn send(&self, id: &str, text: &str) -> Result<()> {
        let reply = self
            .call(Call::Send {
                id: id.to_string(),
                text: text.to_string(),
            })
            .await?;
        expect_ok(reply)
    }

    pub async fn poll(&self, id: &str, timeout_ms: i64) -> Result<Vec<ChatMessage>> {
        let reply = self
            .call(Call::Poll {
                id: id.to_string(),
                timeout_ms,
            })
            .await?;
        match reply {
            Reply::Messages { messages } => Ok(messages),
            other => expect_ok(other).map(|()| Vec::new()),
        }
    }

    pub async fn leave(&self, id: &str) -> Result<()> {
        let reply = self.call(Call::Leave { id: id.to_string() }).await?;
        expect_ok(reply)
    }

    async fn call(&self, call: Call) -> Result<Reply> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (respond_to, response) = oneshot::channel();
        self.pending.lock().await.insert(seq, respond_to);

        let sent = {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, &Request { seq, call }).await
        };
        if let Err(err) = sent {
            self.pending.lock().await.remove(&seq);
            return Err(err).context("failed to send request");
        }

        response.await.context("connection closed before reply")
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn expect_ok(reply: Reply) -> Result<()> {
    match reply {
        Reply::Joined { ok: true } | Reply::Sent { ok: true } | Reply::Left { ok: true } => Ok(()),
        Reply::Error { code, message } => Err(RemoteError { code, message }.into()),
        other => bail!("unexpected reply: {other:?}"),
    }
}

async fn route_replies(mut reader: BufReader<OwnedReadHalf>, pending: Pending) {
    loop {
        match read_message::<_, Response>(&mut reader).await {
            Ok(Some(Response { seq, reply })) => match pending.lock().await.remove(&seq) {
                Some(respond_to) => {
                    let _ = respond_to.send(reply);
                }
                None => debug!(seq, "reply for unknown request"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(error = ?err, "failed to read reply");
                break;
            }
        }
    }

    // Dropping the senders fails every outstanding call.
    pending.lock().await.clear();
}

/// Interactive terminal session: joins, prints everything the hub delivers,
/// and sends each line typed on stdin.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let id = match args.id {
        Some(id) => resolve_identity(&id),
        None => prompt_identity(&mut stdin).await?,
    };

    let client = Arc::new(RpcClient::connect(args.server).await?);
    client
        .join(&id)
        .await
        .with_context(|| format!("failed to join as '{id}'"))?;
    write_stdout(&format!("Joined as {id}. Type messages. Type 'exit' to quit.")).await?;

    let mut receiver = tokio::spawn(poll_loop(
        Arc::clone(&client),
        id.clone(),
        args.poll_timeout_ms,
    ));
    let mut input = String::new();

    let result = run_client_loop(&client, &id, &mut stdin, &mut input, &mut receiver).await;

    receiver.abort();
    if let Err(error) = client.leave(&id).await {
        debug!(?error, "leave failed");
    }

    result
}

fn resolve_identity(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        ANONYMOUS.to_string()
    } else {
        trimmed.to_string()
    }
}

async fn prompt_identity(stdin: &mut BufReader<tokio::io::Stdin>) -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter your ID: ").await?;
    stdout.flush().await?;

    let mut line = String::new();
    stdin.read_line(&mut line).await?;
    Ok(resolve_identity(&line))
}

async fn run_client_loop(
    client: &RpcClient,
    id: &str,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    receiver: &mut JoinHandle<()>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, client, id).await? {
                    break;
                }
            }
            _ = &mut *receiver => {
                // The poll loop only ends when the hub stops answering.
                break;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &RpcClient,
    id: &str,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text == "exit" || text == "/exit" {
        write_stdout("bye!").await?;
        return Ok(false);
    }

    if let Err(err) = client.send(id, text).await {
        write_stderr(&format!("send error: {err:#}")).await?;
    }
    Ok(true)
}

async fn poll_loop(client: Arc<RpcClient>, id: String, timeout_ms: i64) {
    loop {
        match client.poll(&id, timeout_ms).await {
            Ok(messages) => {
                for message in messages {
                    if write_stdout(&render_message(&message)).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                let _ = write_stderr(&format!("poll error: {err:#}")).await;
                return;
            }
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Formats a delivered message for the terminal: notices verbatim, chat lines
/// with the local wall-clock time.
pub fn render_message(message: &ChatMessage) -> String {
    if message.system {
        message.text.clone()
    } else {
        format!(
            "[{}] {}: {}",
            message.time.with_timezone(&Local).format("%H:%M:%S"),
            message.from,
            message.text
        )
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
