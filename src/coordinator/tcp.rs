use super::protocol::{decode_line, encode_line};
use super::{SelectionReport, SourceRequest, WorkItem, WorkSource};
use crate::{Result, TicketQueueError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Waiting `next` calls by worker id, tagged with a call number.
type Pending = Arc<DashMap<usize, (u64, oneshot::Sender<WorkItem>)>>;

#[derive(Clone)]
struct Connection {
    lines: mpsc::UnboundedSender<String>,
    pending: Pending,
    closed: Arc<AtomicBool>,
}

impl Connection {
    fn send(&self, request: &SourceRequest) -> Result<()> {
        self.lines
            .send(encode_line(request)?)
            .map_err(|_| TicketQueueError::ChannelClosed("request source connection closed".to_string()))
    }
}

/// Request source reached over one persistent TCP socket.
///
/// Replies to `NEXT` carry the worker id and are routed back to whichever
/// call asked for that worker, so several workers can wait at once.
pub struct TcpWorkSource {
    address: String,
    connection: Mutex<Option<Connection>>,
    calls: AtomicU64,
}

impl TcpWorkSource {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    async fn connection(&self) -> Result<Connection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.closed.load(Ordering::SeqCst) {
                return Ok(connection.clone());
            }
        }

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TicketQueueError::BrokerUnavailable(format!("{}: {}", self.address, e)))?;
        info!(address = %self.address, "Connected to request source");

        let (reader, writer) = stream.into_split();
        let (lines, outgoing) = mpsc::unbounded_channel();
        let connection = Connection {
            lines,
            pending: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };

        tokio::spawn(write_lines(writer, outgoing));
        tokio::spawn(route_replies(
            BufReader::new(reader),
            Arc::clone(&connection.pending),
            Arc::clone(&connection.closed),
            connection.lines.downgrade(),
        ));

        *slot = Some(connection.clone());
        Ok(connection)
    }
}

async fn write_lines(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outgoing.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Failed to write to request source: {}", e);
            break;
        }
    }
}

async fn route_replies(
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    outgoing: mpsc::WeakUnboundedSender<String>,
) {
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_line::<WorkItem>(&line) {
                Ok(item) => {
                    let undelivered = match pending.remove(&item.worker) {
                        Some((_, (_, reply))) => reply.send(item).err(),
                        None => Some(item),
                    };
                    if let Some(item) = undelivered {
                        warn!(worker = item.worker, request_id = %item.request_id, "Nobody waiting for work item, returning it");
                        let returned = encode_line(&SourceRequest::Return(item));
                        match (returned, outgoing.upgrade()) {
                            (Ok(line), Some(outgoing)) => {
                                let _ = outgoing.send(line);
                            }
                            _ => warn!("Could not return work item"),
                        }
                    }
                }
                Err(e) => warn!("Ignoring reply from request source: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Request source connection failed: {}", e);
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Wakes every waiting `next` with an error.
    pending.clear();
    info!("Request source connection closed");
}

/// One outstanding `NEXT`. Dropped before the item is taken, it withdraws
/// the call and returns an item that already arrived.
struct PendingNext {
    connection: Connection,
    worker: usize,
    call: u64,
    item: oneshot::Receiver<WorkItem>,
    taken: bool,
}

impl PendingNext {
    async fn item(&mut self) -> Result<WorkItem> {
        let item = (&mut self.item)
            .await
            .map_err(|_| TicketQueueError::ChannelClosed("request source connection closed".to_string()))?;
        self.taken = true;
        Ok(item)
    }
}

impl Drop for PendingNext {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        let call = self.call;
        self.connection.pending.remove_if(&self.worker, |_, (current, _)| *current == call);
        if let Ok(item) = self.item.try_recv() {
            debug!(worker = self.worker, request_id = %item.request_id, "Caller gone, returning work item");
            if let Err(e) = self.connection.send(&SourceRequest::Return(item)) {
                warn!(worker = self.worker, "Could not return work item: {}", e);
            }
        }
    }
}

#[async_trait]
impl WorkSource for TcpWorkSource {
    async fn next(&self, worker: usize) -> Result<WorkItem> {
        let connection = self.connection().await?;
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let (reply, item) = oneshot::channel();
        connection.pending.insert(worker, (call, reply));
        let mut pending = PendingNext {
            connection: connection.clone(),
            worker,
            call,
            item,
            taken: false,
        };
        if connection.closed.load(Ordering::SeqCst) {
            return Err(TicketQueueError::ChannelClosed("request source connection closed".to_string()));
        }

        connection.send(&SourceRequest::Next { worker })?;
        pending.item().await
    }

    async fn done(&self, report: &SelectionReport) -> Result<()> {
        self.connection().await?.send(&SourceRequest::Done(report.clone()))
    }

    async fn give_back(&self, item: WorkItem) -> Result<()> {
        self.connection().await?.send(&SourceRequest::Return(item))
    }
}

/// Exposes a [`WorkSource`] as the line-delimited JSON request source.
///
/// Every `NEXT` is answered exactly once, as soon as work exists. `DONE`
/// and `RETURN` have no reply. Items a connection still holds when it
/// closes are given back to the source.
pub struct WorkSourceServer {
    source: Arc<dyn WorkSource>,
}

impl WorkSourceServer {
    pub fn new(source: Arc<dyn WorkSource>) -> Self {
        Self { source }
    }

    pub async fn serve(&self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(address = ?listener.local_addr().ok(), "Request source listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Request source received shutdown signal");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "Coordinator connected");
                    let source = Arc::clone(&self.source);
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, source).await {
                            warn!(%peer, "Coordinator connection ended: {}", e);
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        Ok(())
    }
}

type Outstanding = Arc<StdMutex<HashMap<String, WorkItem>>>;

async fn serve_connection(stream: TcpStream, source: Arc<dyn WorkSource>) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let (replies, outgoing) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_lines(writer, outgoing));
    // Outstanding NEXT requests; dropped with the connection.
    let mut waiting = JoinSet::new();
    // Items sent and neither done nor returned yet.
    let outstanding: Outstanding = Arc::new(StdMutex::new(HashMap::new()));

    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<SourceRequest>(&line) {
            Ok(SourceRequest::Next { worker }) => {
                let source = Arc::clone(&source);
                let replies = replies.clone();
                let outstanding = Arc::clone(&outstanding);
                waiting.spawn(async move {
                    let item = match source.next(worker).await {
                        Ok(item) => item,
                        Err(e) => {
                            error!(worker, "Request source failed: {}", e);
                            return;
                        }
                    };
                    let request_id = item.request_id.clone();
                    let line = encode_line(&item);
                    hold(&outstanding).insert(request_id.clone(), item);
                    match line {
                        Ok(line) => {
                            if replies.send(line).is_err() {
                                warn!(worker, request_id = %request_id, "Coordinator gone before item was sent");
                            }
                        }
                        Err(e) => error!(worker, "Failed to encode work item: {}", e),
                    }
                });
            }
            Ok(SourceRequest::Done(report)) => {
                debug!(worker = report.worker, request_id = %report.request_id, success = report.success, "Worker done");
                hold(&outstanding).remove(&report.request_id);
                if let Err(e) = source.done(&report).await {
                    warn!(request_id = %report.request_id, "Failed to complete request: {}", e);
                }
            }
            Ok(SourceRequest::Return(item)) => {
                let held = hold(&outstanding).remove(&item.request_id).is_some();
                if held {
                    give_back(source.as_ref(), item).await;
                } else {
                    warn!(request_id = %item.request_id, "Returned item was not outstanding");
                }
            }
            Err(e) => warn!("Ignoring request: {}", e),
        }
        while waiting.try_join_next().is_some() {}
    };

    waiting.shutdown().await;
    drop(replies);
    let _ = writer_task.await;

    let stranded: Vec<WorkItem> = hold(&outstanding).drain().map(|(_, item)| item).collect();
    if !stranded.is_empty() {
        info!(count = stranded.len(), "Coordinator left with items in flight, giving them back");
    }
    for item in stranded {
        give_back(source.as_ref(), item).await;
    }
    result
}

fn hold(outstanding: &Outstanding) -> std::sync::MutexGuard<'_, HashMap<String, WorkItem>> {
    outstanding.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn give_back(source: &dyn WorkSource, item: WorkItem) {
    let request_id = item.request_id.clone();
    if let Err(e) = source.give_back(item).await {
        warn!(request_id = %request_id, "Failed to give item back: {}", e);
    }
}
