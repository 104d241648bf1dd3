use std::{collections::HashSet, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    sync::{Mutex, mpsc, watch},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Call, Reply, Request, Response, read_message, write_message},
    service::ChatService,
};

/// Replies queued per connection before request tasks start waiting on the
/// writer.
const OUTBOUND_CAPACITY: usize = 64;

const WRITER_DRAIN: Duration = Duration::from_millis(500);

/// How long a closed connection waits for its in-flight calls before leaving
/// its identities anyway.
const CALL_DRAIN: Duration = Duration::from_millis(500);

/// Serves a [`ChatService`] over JSON lines on TCP.
pub struct Server {
    listener: TcpListener,
    service: Arc<ChatService>,
}

impl Server {
    pub fn new(listener: TcpListener, service: Arc<ChatService>) -> Self {
        Self { listener, service }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, service } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("hub shutting down");
                    service.shutdown().await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &service);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    service: &Arc<ChatService>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, service),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, service: &Arc<ChatService>) {
    let service = Arc::clone(service);
    tokio::spawn(async move {
        debug!(%peer, "connection opened");
        if let Err(err) = handle_connection(stream, &service).await {
            warn!(%peer, error = ?err, "connection closed with error");
        }
    });
}

/// Identities joined over one connection and not yet left.
type Session = Arc<Mutex<HashSet<String>>>;

async fn handle_connection(stream: TcpStream, service: &Arc<ChatService>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let mut writer_task = tokio::spawn(write_responses(writer, outbound_rx));
    let session = Session::default();
    let (closed, closed_rx) = watch::channel(false);
    let mut calls = JoinSet::new();

    let result = serve_requests(
        &mut reader,
        service,
        &session,
        &outbound,
        &closed_rx,
        &mut calls,
    )
    .await;
    drop(outbound);

    // Parked Polls give up; Joins, Sends and Leaves run to completion so the
    // session is final before it is cleaned up.
    let _ = closed.send(true);
    if timeout(CALL_DRAIN, drain_calls(&mut calls)).await.is_err() {
        // Under the block policy a call can be stuck behind one of this
        // connection's own full queues. Leaving closes those queues.
        cleanup_session(service, &session, peer).await;
        if timeout(CALL_DRAIN, drain_calls(&mut calls)).await.is_err() {
            warn!(?peer, pending = calls.len(), "aborting calls of closed connection");
            calls.shutdown().await;
        }
    }
    cleanup_session(service, &session, peer).await;

    if timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        writer_task.abort();
    }

    result
}

async fn serve_requests<R>(
    reader: &mut R,
    service: &Arc<ChatService>,
    session: &Session,
    outbound: &mpsc::Sender<Response>,
    closed: &watch::Receiver<bool>,
    calls: &mut JoinSet<()>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    // Each call gets its own task so a parked Poll never holds up a Send on
    // the same connection.
    while let Some(request) = read_message::<_, Request>(reader).await? {
        let service = Arc::clone(service);
        let session = Arc::clone(session);
        let outbound = outbound.clone();
        let mut closed = closed.clone();
        calls.spawn(async move {
            let Request { seq, call } = request;
            let cancellable = matches!(call, Call::Poll { .. });
            let reply = select! {
                reply = dispatch(&service, &session, call) => reply,
                _ = closed.wait_for(|closed| *closed), if cancellable => {
                    debug!(seq, "poll abandoned by closed connection");
                    return;
                }
            };
            if outbound.send(Response { seq, reply }).await.is_err() {
                debug!(seq, "connection gone before reply was written");
            }
        });

        while calls.try_join_next().is_some() {}
    }

    Ok(())
}

async fn drain_calls(calls: &mut JoinSet<()>) {
    while let Some(result) = calls.join_next().await {
        if let Err(err) = result {
            warn!(error = ?err, "request task failed");
        }
    }
}

async fn write_responses(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Response>) {
    while let Some(response) = outbound.recv().await {
        if let Err(err) = write_message(&mut writer, &response).await {
            debug!(?err, "failed to deliver reply to client");
            break;
        }
    }
}

async fn dispatch(service: &ChatService, session: &Session, call: Call) -> Reply {
    let result = match call {
        Call::Join { id } => match service.join(&id).await {
            Ok(()) => {
                session.lock().await.insert(id);
                Ok(Reply::Joined { ok: true })
            }
            Err(err) => Err(err),
        },
        Call::Send { id, text } => service
            .send(&id, &text)
            .await
            .map(|()| Reply::Sent { ok: true }),
        Call::Poll { id, timeout_ms } => service
            .poll(&id, timeout_ms)
            .await
            .map(|messages| Reply::Messages { messages }),
        Call::Leave { id } => {
            let result = service.leave(&id).await;
            session.lock().await.remove(&id);
            result.map(|()| Reply::Left { ok: true })
        }
    };

    result.unwrap_or_else(Reply::from)
}

async fn cleanup_session(service: &ChatService, session: &Session, peer: Option<SocketAddr>) {
    let identities: Vec<String> = session.lock().await.drain().collect();
    for identity in identities {
        if service.leave(&identity).await.is_ok() {
            info!(?peer, %identity, "client disconnected");
        }
    }
}
