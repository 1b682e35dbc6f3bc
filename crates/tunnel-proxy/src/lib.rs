//! Reverse-tunnel multiplexer.
//!
//! One instance runs at each end of a tunnel: the gateway side opens logical
//! channels (operator sessions, direct-tcpip forwards), the agent side
//! accepts them. Logical channels are exposed as plain byte streams so the
//! SSH machinery on either side never sees the framing.

#[macro_use]
extern crate tracing;

mod id_allocator;

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use shellhub_task::TaskHandle;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tunnel_proto::{ChannelId, ControlMessage, Frame, FrameCodec, OpenRequest, ReasonCode};

use crate::id_allocator::IdAllocator;

/// Consumer half of a logical channel.
pub type ChannelStream = tokio::io::DuplexStream;

/// How long the initiator waits for the acceptor to answer a channel open.
pub const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

const CHANNEL_BUFFER_SIZE: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;
const INCOMING_SESSION_BACKLOG: usize = 16;

// Safety net against poor AsyncRead implementations that keep returning the
// same error instead of terminating.
const MAX_CONSECUTIVE_PIPE_FAILURES: u8 = 5;

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Bound on concurrently open logical channels (control excluded).
    pub max_channels: usize,
    pub accept_sessions: bool,
    pub accept_direct_tcpip: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_channels: 64,
            accept_sessions: false,
            accept_direct_tcpip: false,
        }
    }
}

impl TunnelConfig {
    /// Gateway side: opens channels, accepts none.
    pub fn initiator() -> Self {
        Self::default()
    }

    /// Agent side: accepts session and direct-tcpip channels.
    pub fn acceptor() -> Self {
        Self {
            max_channels: 64,
            accept_sessions: true,
            accept_direct_tcpip: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("channel refused by peer: {reason} ({description})")]
    Refused { reason: ReasonCode, description: String },
    #[error("too many channels opened on this tunnel")]
    ResourceShortage,
    #[error("channel open timed out")]
    TimedOut,
    #[error("tunnel is closed")]
    TunnelClosed,
}

/// A session channel opened by the remote initiator.
pub struct IncomingSession {
    pub session_id: String,
    pub stream: ChannelStream,
}

enum ApiRequest {
    OpenChannel {
        request: OpenRequest,
        response_tx: oneshot::Sender<Result<ChannelStream, OpenError>>,
    },
    Keepalive {
        seq: u64,
    },
    Close,
}

/// Cloneable handle over a running tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    request_tx: mpsc::Sender<ApiRequest>,
    ack_rx: watch::Receiver<u64>,
}

impl TunnelHandle {
    pub async fn open_session(&self, session_id: impl Into<String>) -> Result<ChannelStream, OpenError> {
        self.open(OpenRequest::Session {
            session_id: session_id.into(),
        })
        .await
    }

    pub async fn open_direct_tcpip(&self, host: impl Into<String>, port: u16) -> Result<ChannelStream, OpenError> {
        self.open(OpenRequest::DirectTcpip {
            host: host.into(),
            port,
        })
        .await
    }

    async fn open(&self, request: OpenRequest) -> Result<ChannelStream, OpenError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(ApiRequest::OpenChannel { request, response_tx })
            .await
            .map_err(|_| OpenError::TunnelClosed)?;

        match tokio::time::timeout(CHANNEL_OPEN_TIMEOUT, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OpenError::TunnelClosed),
            Err(_) => Err(OpenError::TimedOut),
        }
    }

    /// Sends a keepalive probe; acks are observable through [`Self::last_ack`].
    pub async fn keepalive(&self, seq: u64) -> Result<(), OpenError> {
        self.request_tx
            .send(ApiRequest::Keepalive { seq })
            .await
            .map_err(|_| OpenError::TunnelClosed)
    }

    /// Highest keepalive sequence number acknowledged by the peer.
    pub fn last_ack(&self) -> u64 {
        *self.ack_rx.borrow()
    }

    /// Asks the engine to terminate; every open channel observes EOF.
    pub async fn close(&self) {
        let _ = self.request_tx.send(ApiRequest::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    /// Resolves when the engine is gone.
    pub async fn closed(&self) {
        self.request_tx.closed().await;
    }
}

pub struct TunnelProxy {
    cfg: TunnelConfig,
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    request_tx: mpsc::Sender<ApiRequest>,
    request_rx: mpsc::Receiver<ApiRequest>,
    ack_tx: watch::Sender<u64>,
    ack_rx: watch::Receiver<u64>,
    session_tx: Option<mpsc::Sender<IncomingSession>>,
}

impl TunnelProxy {
    pub fn new(reader: Box<dyn AsyncRead + Unpin + Send>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (ack_tx, ack_rx) = watch::channel(0);

        Self {
            cfg: TunnelConfig::default(),
            reader,
            writer,
            request_tx,
            request_rx,
            ack_tx,
            ack_rx,
            session_tx: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, cfg: TunnelConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Registers the consumer of inbound session channels and returns its
    /// receiving end.
    #[must_use]
    pub fn session_acceptor(&mut self) -> mpsc::Receiver<IncomingSession> {
        let (tx, rx) = mpsc::channel(INCOMING_SESSION_BACKLOG);
        self.session_tx = Some(tx);
        rx
    }

    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            request_tx: self.request_tx.clone(),
            ack_rx: self.ack_rx.clone(),
        }
    }

    pub fn spawn(self) -> TaskHandle<anyhow::Result<()>> {
        TaskHandle::spawn(self.run())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let TunnelProxy {
            cfg,
            reader,
            writer,
            request_tx,
            request_rx,
            ack_tx,
            ack_rx: _,
            session_tx,
        } = self;

        let (msg_to_send_tx, msg_to_send_rx) = mpsc::unbounded_channel::<Frame>();

        let frame_stream = FramedRead::new(reader, FrameCodec);
        let frame_sink = FramedWrite::new(writer, FrameCodec);

        let sender_task = SenderTask {
            frame_sink,
            msg_to_send_rx,
        }
        .spawn();

        let scheduler_task = SchedulerTask {
            cfg,
            frame_stream,
            msg_to_send_tx,
            request_rx,
            // Termination comes from an explicit Close or the pipe ending,
            // not from handles going out of scope.
            _request_tx: request_tx,
            ack_tx,
            session_tx,
        }
        .spawn();

        match tokio::try_join!(scheduler_task.join(), sender_task.join()).context("task join failed")? {
            (Ok(()), Err(error)) => debug!(%error, "Sender task failed"),
            (Err(error), Ok(())) => debug!(%error, "Scheduler task failed"),
            (Err(scheduler_error), Err(sender_error)) => {
                anyhow::bail!("both scheduler and sender tasks failed: {scheduler_error} & {sender_error}");
            }
            (Ok(()), Ok(())) => {}
        }

        Ok(())
    }
}

// === implementation details === //

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum ChannelState {
    Streaming,
    Eof,
    Closed,
}

enum WriteMsg {
    Data(Bytes),
    Eof,
}

struct ChannelCtx {
    data_tx: mpsc::UnboundedSender<WriteMsg>,
    local_state: ChannelState,
    remote_state: ChannelState,
    _reader_task: TaskHandle<()>,
}

enum InternalMessage {
    /// The local consumer stopped writing (EOF on the engine-side reader).
    LocalEof { id: ChannelId },
    /// The local consumer is gone (write into it failed).
    WriteFailed { id: ChannelId },
    /// Onward TCP connection for a direct-tcpip open is established.
    TcpResolved { id: ChannelId, stream: TcpStream },
    TcpFailed { id: ChannelId, error: io::Error },
}

struct SenderTask<W: AsyncWrite + Unpin + Send + 'static> {
    frame_sink: FramedWrite<W, FrameCodec>,
    msg_to_send_rx: mpsc::UnboundedReceiver<Frame>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> SenderTask<W> {
    fn spawn(self) -> TaskHandle<anyhow::Result<()>> {
        TaskHandle::spawn(self.run())
    }

    #[instrument("sender", skip_all)]
    async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut frame_sink,
            mut msg_to_send_rx,
        } = self;

        while let Some(frame) = msg_to_send_rx.recv().await {
            frame_sink.feed(frame).await?;
            frame_sink.flush().await?;
        }

        debug!("Closing tunnel sender task");

        Ok(())
    }
}

struct SchedulerTask<R: AsyncRead + Unpin + Send + 'static> {
    cfg: TunnelConfig,
    frame_stream: FramedRead<R, FrameCodec>,
    msg_to_send_tx: mpsc::UnboundedSender<Frame>,
    request_rx: mpsc::Receiver<ApiRequest>,
    _request_tx: mpsc::Sender<ApiRequest>,
    ack_tx: watch::Sender<u64>,
    session_tx: Option<mpsc::Sender<IncomingSession>>,
}

impl<R: AsyncRead + Unpin + Send + 'static> SchedulerTask<R> {
    fn spawn(self) -> TaskHandle<anyhow::Result<()>> {
        TaskHandle::spawn(scheduler_task_impl(self))
    }
}

macro_rules! send_control {
    ($tx:expr, $msg:expr) => {{
        let frame = Frame::control(&$msg).context("encode control message")?;
        $tx.send(frame).context("couldn’t queue control message")?;
    }};
}

#[instrument("scheduler", skip_all)]
async fn scheduler_task_impl<R: AsyncRead + Unpin + Send + 'static>(task: SchedulerTask<R>) -> anyhow::Result<()> {
    let SchedulerTask {
        cfg,
        mut frame_stream,
        msg_to_send_tx,
        mut request_rx,
        _request_tx,
        ack_tx,
        session_tx,
    } = task;

    let mut id_allocator = IdAllocator::new();
    let mut channels: HashMap<ChannelId, ChannelCtx> = HashMap::new();
    let mut pending_channels: HashMap<ChannelId, oneshot::Sender<Result<ChannelStream, OpenError>>> = HashMap::new();
    let (internal_msg_tx, mut internal_msg_rx) = mpsc::unbounded_channel::<InternalMessage>();

    let mut nb_consecutive_pipe_failures = 0;

    // The scheduler owns the channel table and must keep processing messages
    // continuously: no `await` is allowed inside the select arms.
    'scheduler: loop {
        tokio::select! {
            request = request_rx.recv() => {
                let Some(request) = request else {
                    debug!("All tunnel handles are gone");
                    break;
                };

                match request {
                    ApiRequest::OpenChannel { request, response_tx } => {
                        if channels.len() + pending_channels.len() >= cfg.max_channels {
                            let _ = response_tx.send(Err(OpenError::ResourceShortage));
                            continue;
                        }

                        let Some(id) = id_allocator.alloc() else {
                            let _ = response_tx.send(Err(OpenError::ResourceShortage));
                            continue;
                        };

                        trace!(%id, ?request, "Requesting channel");
                        pending_channels.insert(id, response_tx);
                        send_control!(msg_to_send_tx, ControlMessage::Open { id, request });
                    }
                    ApiRequest::Keepalive { seq } => {
                        send_control!(msg_to_send_tx, ControlMessage::Keepalive { seq });
                    }
                    ApiRequest::Close => {
                        debug!("Tunnel close requested");
                        break;
                    }
                }
            }
            Some(internal_msg) = internal_msg_rx.recv() => {
                match internal_msg {
                    InternalMessage::LocalEof { id } => {
                        let Some(channel) = channels.get_mut(&id) else { continue };

                        match channel.remote_state {
                            ChannelState::Streaming => {
                                channel.local_state = ChannelState::Eof;
                                send_control!(msg_to_send_tx, ControlMessage::Eof { id });
                            }
                            ChannelState::Eof | ChannelState::Closed => {
                                send_control!(msg_to_send_tx, ControlMessage::Close { id });
                                unregister_channel(&mut channels, &mut id_allocator, id);
                                trace!(%id, "Channel closed");
                            }
                        }
                    }
                    InternalMessage::WriteFailed { id } => {
                        if channels.remove(&id).is_some() {
                            id_allocator.free(id);
                            send_control!(msg_to_send_tx, ControlMessage::Close { id });
                            trace!(%id, "Channel consumer is gone");
                        }
                    }
                    InternalMessage::TcpResolved { id, stream } => {
                        let (tcp_reader, tcp_writer) = stream.into_split();
                        let ctx = start_channel_tasks(id, tcp_reader, tcp_writer, &msg_to_send_tx, &internal_msg_tx);
                        channels.insert(id, ctx);
                        send_control!(msg_to_send_tx, ControlMessage::OpenSuccess { id });
                        trace!(%id, "Direct-tcpip channel accepted");
                    }
                    InternalMessage::TcpFailed { id, error } => {
                        debug!(%id, %error, "Onward TCP connection failed");
                        send_control!(msg_to_send_tx, ControlMessage::OpenFailure {
                            id,
                            reason: ReasonCode::ConnectFailed,
                            description: error.to_string(),
                        });
                    }
                }
            }
            frame = frame_stream.next() => {
                let Some(frame) = frame else {
                    debug!("Tunnel pipe was closed by peer");
                    break;
                };

                let frame = match frame {
                    Ok(frame) => {
                        nb_consecutive_pipe_failures = 0;
                        frame
                    }
                    Err(error) => {
                        warn!(%error, "Tunnel pipe error");
                        nb_consecutive_pipe_failures += 1;
                        if nb_consecutive_pipe_failures > MAX_CONSECUTIVE_PIPE_FAILURES {
                            anyhow::bail!("forced tunnel shutdown because of too many consecutive pipe failures");
                        }
                        continue;
                    }
                };

                if !frame.channel.is_control() {
                    let id = frame.channel;
                    match channels.get(&id) {
                        Some(channel) => {
                            let _ = channel.data_tx.send(WriteMsg::Data(frame.payload));
                        }
                        None => trace!(%id, "Data for an unknown channel"),
                    }
                    continue;
                }

                let msg = match frame.control_message() {
                    Ok(msg) => msg,
                    Err(error) => {
                        warn!(%error, "Peer sent an invalid control message");
                        continue;
                    }
                };

                match msg {
                    ControlMessage::Open { id, request } => {
                        if channels.contains_key(&id) {
                            warn!(%id, "Peer reused an open channel id");
                            continue;
                        }

                        if channels.len() >= cfg.max_channels {
                            send_control!(msg_to_send_tx, ControlMessage::OpenFailure {
                                id,
                                reason: ReasonCode::ResourceShortage,
                                description: format!("tunnel channel budget ({}) exhausted", cfg.max_channels),
                            });
                            continue;
                        }

                        match request {
                            OpenRequest::Session { session_id } if cfg.accept_sessions => {
                                let Some(session_tx) = session_tx.as_ref() else {
                                    send_control!(msg_to_send_tx, ControlMessage::OpenFailure {
                                        id,
                                        reason: ReasonCode::GeneralFailure,
                                        description: "no session acceptor".to_owned(),
                                    });
                                    continue;
                                };

                                let (user_half, engine_half) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
                                let (engine_reader, engine_writer) = tokio::io::split(engine_half);
                                let ctx = start_channel_tasks(id, engine_reader, engine_writer, &msg_to_send_tx, &internal_msg_tx);

                                match session_tx.try_send(IncomingSession { session_id, stream: user_half }) {
                                    Ok(()) => {
                                        channels.insert(id, ctx);
                                        send_control!(msg_to_send_tx, ControlMessage::OpenSuccess { id });
                                        debug!(%id, "Session channel accepted");
                                    }
                                    Err(error) => {
                                        debug!(%id, %error, "Session acceptor is not keeping up");
                                        send_control!(msg_to_send_tx, ControlMessage::OpenFailure {
                                            id,
                                            reason: ReasonCode::ResourceShortage,
                                            description: "session backlog full".to_owned(),
                                        });
                                    }
                                }
                            }
                            OpenRequest::DirectTcpip { host, port } if cfg.accept_direct_tcpip => {
                                let internal_msg_tx = internal_msg_tx.clone();
                                TaskHandle::spawn(async move {
                                    match TcpStream::connect((host.as_str(), port)).await {
                                        Ok(stream) => {
                                            let _ = internal_msg_tx.send(InternalMessage::TcpResolved { id, stream });
                                        }
                                        Err(error) => {
                                            let _ = internal_msg_tx.send(InternalMessage::TcpFailed { id, error });
                                        }
                                    }
                                })
                                .detach();
                            }
                            request => {
                                debug!(%id, ?request, "Channel kind refused on this end");
                                send_control!(msg_to_send_tx, ControlMessage::OpenFailure {
                                    id,
                                    reason: ReasonCode::Prohibited,
                                    description: "channel kind not accepted by this peer".to_owned(),
                                });
                            }
                        }
                    }
                    ControlMessage::OpenSuccess { id } => {
                        let Some(response_tx) = pending_channels.remove(&id) else {
                            warn!(%id, "Open-success for an unknown pending channel");
                            continue;
                        };

                        let (user_half, engine_half) = tokio::io::duplex(CHANNEL_BUFFER_SIZE);
                        let (engine_reader, engine_writer) = tokio::io::split(engine_half);
                        let ctx = start_channel_tasks(id, engine_reader, engine_writer, &msg_to_send_tx, &internal_msg_tx);
                        channels.insert(id, ctx);

                        if response_tx.send(Ok(user_half)).is_err() {
                            // Requester gave up (timeout): close the channel right away.
                            send_control!(msg_to_send_tx, ControlMessage::Close { id });
                            unregister_channel(&mut channels, &mut id_allocator, id);
                        } else {
                            debug!(%id, "Channel opened");
                        }
                    }
                    ControlMessage::OpenFailure { id, reason, description } => {
                        let Some(response_tx) = pending_channels.remove(&id) else {
                            warn!(%id, "Open-failure for an unknown pending channel");
                            continue;
                        };

                        debug!(%id, %reason, description, "Channel open refused");
                        id_allocator.free(id);
                        let _ = response_tx.send(Err(OpenError::Refused { reason, description }));
                    }
                    ControlMessage::Eof { id } => {
                        let Some(channel) = channels.get_mut(&id) else { continue };

                        channel.remote_state = ChannelState::Eof;
                        let _ = channel.data_tx.send(WriteMsg::Eof);

                        if channel.local_state == ChannelState::Eof {
                            send_control!(msg_to_send_tx, ControlMessage::Close { id });
                            unregister_channel(&mut channels, &mut id_allocator, id);
                            trace!(%id, "Channel closed");
                        }
                    }
                    ControlMessage::Close { id } => {
                        let Some(channel) = channels.get_mut(&id) else { continue };

                        if channel.local_state != ChannelState::Closed {
                            channel.local_state = ChannelState::Closed;
                            send_control!(msg_to_send_tx, ControlMessage::Close { id });
                        }

                        unregister_channel(&mut channels, &mut id_allocator, id);
                        trace!(%id, "Channel closed by peer");
                    }
                    ControlMessage::Keepalive { seq } => {
                        send_control!(msg_to_send_tx, ControlMessage::KeepaliveAck { seq });
                    }
                    ControlMessage::KeepaliveAck { seq } => {
                        ack_tx.send_replace(seq);
                    }
                }
            }
            else => break 'scheduler,
        }
    }

    // Every pending open fails, every channel task is dropped: consumers
    // observe EOF.
    for (_, response_tx) in pending_channels.drain() {
        let _ = response_tx.send(Err(OpenError::TunnelClosed));
    }
    channels.clear();

    debug!("Tunnel scheduler terminated");

    Ok(())
}

fn unregister_channel(channels: &mut HashMap<ChannelId, ChannelCtx>, id_allocator: &mut IdAllocator, id: ChannelId) {
    if channels.remove(&id).is_some() {
        id_allocator.free(id);
    }
}

/// Spawns the two pump tasks of a live channel and returns its context.
fn start_channel_tasks<R, W>(
    id: ChannelId,
    reader: R,
    writer: W,
    msg_to_send_tx: &mpsc::UnboundedSender<Frame>,
    internal_msg_tx: &mpsc::UnboundedSender<InternalMessage>,
) -> ChannelCtx
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (data_tx, data_rx) = mpsc::unbounded_channel::<WriteMsg>();

    TaskHandle::spawn(channel_writer_task(id, writer, data_rx, internal_msg_tx.clone())).detach();

    let reader_task = TaskHandle::spawn(channel_reader_task(
        id,
        reader,
        msg_to_send_tx.clone(),
        internal_msg_tx.clone(),
    ));

    ChannelCtx {
        data_tx,
        local_state: ChannelState::Streaming,
        remote_state: ChannelState::Streaming,
        _reader_task: reader_task,
    }
}

/// Pumps remote payloads into the local consumer.
async fn channel_writer_task<W>(
    id: ChannelId,
    mut writer: W,
    mut data_rx: mpsc::UnboundedReceiver<WriteMsg>,
    internal_msg_tx: mpsc::UnboundedSender<InternalMessage>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = data_rx.recv().await {
        match msg {
            WriteMsg::Data(bytes) => {
                if let Err(error) = writer.write_all(&bytes).await {
                    trace!(%id, %error, "Channel consumer is gone");
                    let _ = internal_msg_tx.send(InternalMessage::WriteFailed { id });
                    return;
                }
            }
            WriteMsg::Eof => {
                let _ = writer.shutdown().await;
            }
        }
    }

    // Channel unregistered: dropping the writer completes the EOF.
}

/// Pumps local consumer bytes into data frames.
async fn channel_reader_task<R>(
    id: ChannelId,
    mut reader: R,
    msg_to_send_tx: mpsc::UnboundedSender<Frame>,
    internal_msg_tx: mpsc::UnboundedSender<InternalMessage>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let frame = Frame::data(id, Bytes::copy_from_slice(&buf[..n]));
                if msg_to_send_tx.send(frame).is_err() {
                    return;
                }
            }
            Err(error) => {
                trace!(%id, %error, "Channel read failed");
                break;
            }
        }
    }

    let _ = internal_msg_tx.send(InternalMessage::LocalEof { id });
}
