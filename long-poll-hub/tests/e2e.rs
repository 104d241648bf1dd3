use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("long-poll-hub");
    let (mut hub, addr) = spawn_hub(&binary).await?;

    let mut alice = Terminal::spawn(&binary, "alice", &addr).await?;
    assert_eq!(alice.next_line("alice's join notice").await?, "User [alice] joined");

    let mut bob = Terminal::spawn(&binary, "bob", &addr).await?;
    assert_eq!(bob.next_line("bob's join notice").await?, "User [bob] joined");
    assert_eq!(alice.next_line("bob joining").await?, "User [bob] joined");

    alice.send_line("Hello from Alice").await?;
    let heard = bob.next_line("alice's message").await?;
    assert!(heard.ends_with("] alice: Hello from Alice"), "bob saw: {heard}");

    // Alice's next line is bob's reply, so her own message never came back.
    bob.send_line("Hi Alice!").await?;
    let heard = alice.next_line("bob's reply").await?;
    assert!(heard.ends_with("] bob: Hi Alice!"), "alice saw: {heard}");

    alice.send_line("exit").await?;
    assert_eq!(alice.next_line("alice's goodbye").await?, "bye!");
    assert_eq!(bob.next_line("alice leaving").await?, "User [alice] left");

    bob.send_line("/exit").await?;
    assert_eq!(bob.next_line("bob's goodbye").await?, "bye!");

    assert!(alice.child.wait().await?.success(), "alice client failed");
    assert!(bob.child.wait().await?.success(), "bob client failed");

    // The hub outlives its clients.
    hub.kill().await?;
    Ok(())
}

struct Terminal {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Terminal {
    /// Starts `client --id <id>` and waits for its welcome banner.
    async fn spawn(binary: &Path, id: &str, addr: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--id", id, "--server", addr])
            .env("RUST_LOG", "warn")
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn client {id}"))?;

        let mut terminal = Self {
            stdin: child.stdin.take().context("client stdin")?,
            stdout: BufReader::new(child.stdout.take().context("client stdout")?),
            child,
        };
        let banner = terminal.next_line("welcome banner").await?;
        let expected = format!("Joined as {id}. Type messages. Type 'exit' to quit.");
        if banner != expected {
            bail!("expected '{expected}', got '{banner}'");
        }
        Ok(terminal)
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(format!("{line}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self, what: &str) -> Result<String> {
        next_line(&mut self.stdout, what).await
    }
}

/// Starts `serve` on an ephemeral port and returns the bound address from
/// its listening banner.
async fn spawn_hub(binary: &Path) -> Result<(Child, String)> {
    let mut child = Command::new(binary)
        .args(["serve", "--listen", "127.0.0.1:0"])
        .env("NO_COLOR", "1")
        .env("RUST_LOG", "info")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn hub")?;
    let mut logs = BufReader::new(child.stdout.take().context("hub stdout")?);

    let addr = loop {
        let line = next_line(&mut logs, "hub listening banner").await?;
        if let Some((_, addr)) = line.split_once("hub listening on ") {
            break addr.trim().to_string();
        }
    };

    // Keep reading the hub's logs so the pipe never fills.
    tokio::spawn(async move {
        let _ = tokio::io::copy(&mut logs, &mut tokio::io::sink()).await;
    });
    Ok((child, addr))
}

async fn next_line(reader: &mut BufReader<ChildStdout>, what: &str) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .with_context(|| format!("timed out waiting for {what}"))??;
    if read == 0 {
        bail!("stream closed while waiting for {what}");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
