use crate::{
    Error, Result,
    network::{Address, SlotBitmap},
    resp::{Command, CommandEncoder, Value, ValueDecoder, cmd},
};
use futures_util::{SinkExt, Stream, StreamExt, task::noop_waker_ref};
use log::{Level, debug, log_enabled, warn};
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio::net::{
    TcpStream,
    tcp::{OwnedReadHalf, OwnedWriteHalf},
};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Window after a connection drop during which reconnecting to the same
/// address is still attempted before fail-over kicks in.
#[cfg(not(test))]
pub(crate) const RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Shortened under test so the post-window fail-over paths are reachable.
#[cfg(test)]
pub(crate) const RECONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Literal authfile name that disables the AUTH handshake.
pub(crate) const AUTHFILE_NONE: &str = "NONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionStatus {
    Initialized,
    Connected,
    Authorized,
    /// Authorized and the frame decoder still holds undecoded bytes.
    PendingData,
    Disconnected,
    Failed,
}

/// Recoverability verdict, shared between a single connection and the
/// manager-level recovery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    Recovered,
    Recoverable,
    Unrecoverable,
}

/// A single TCP link to a Redis node: connect, AUTH handshake, framed
/// command writes and framed reply reads, with the status machine driving
/// the manager's recovery decisions. The address survives `unlink` so the
/// link can be re-established in place.
#[derive(Debug)]
pub(crate) struct NodeConnection {
    address: Address,
    tag: String,
    status: ConnectionStatus,
    reader: Option<FramedRead<OwnedReadHalf, ValueDecoder>>,
    writer: Option<FramedWrite<OwnedWriteHalf, CommandEncoder>>,
    last_alive: Instant,
    /// hash slots this connection serves
    pub slots: SlotBitmap,
}

impl NodeConnection {
    pub fn new(address: Address) -> Self {
        let tag = address.to_string();
        Self {
            address,
            tag,
            status: ConnectionStatus::Initialized,
            reader: None,
            writer: None,
            last_alive: Instant::now(),
            slots: SlotBitmap::new(),
        }
    }

    pub async fn connect(address: Address, authfile: &str) -> Result<Self> {
        let mut connection = Self::new(address);
        connection.link(authfile).await?;
        Ok(connection)
    }

    /// Establishes the TCP link and runs the AUTH handshake.
    pub async fn link(&mut self, authfile: &str) -> Result<()> {
        debug!("[{}] Connecting...", self.tag);
        let stream =
            TcpStream::connect((self.address.host.as_str(), self.address.port)).await?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        self.reader = Some(FramedRead::new(reader, ValueDecoder));
        self.writer = Some(FramedWrite::new(writer, CommandEncoder));
        self.status = ConnectionStatus::Connected;

        self.authorize(authfile).await?;
        self.last_alive = Instant::now();
        debug!("[{}] Connected", self.tag);
        Ok(())
    }

    async fn authorize(&mut self, authfile: &str) -> Result<()> {
        if let Some(secret) = read_auth_secret(authfile)? {
            let reply = self.call(&cmd("AUTH").arg(&secret).into()).await?;
            if !reply.is_ok() {
                // the link stays connected but unauthorized; callers treat
                // this as non-recoverable
                warn!("[{}] AUTH rejected", self.tag);
                return Err(Error::NoAuth);
            }
        }

        self.status = ConnectionStatus::Authorized;
        Ok(())
    }

    /// Re-establishes the link using the retained address.
    pub async fn reconnect(&mut self, authfile: &str) -> Result<()> {
        self.unlink();
        self.link(authfile).await
    }

    /// Closes the socket, keeping the address for a later reconnect. The
    /// recovery window starts at the moment a live link goes down; failed
    /// reconnect attempts must not extend it.
    pub fn unlink(&mut self) {
        if self.reader.is_some() {
            self.last_alive = Instant::now();
        }
        self.reader = None;
        self.writer = None;
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Ready to send / ready to receive.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Authorized | ConnectionStatus::PendingData
        )
    }

    pub fn recoverable(&self) -> Recovery {
        match self.status {
            ConnectionStatus::Connected | ConnectionStatus::Authorized => Recovery::Recovered,
            _ if self.last_alive.elapsed() < RECONNECT_TIMEOUT => Recovery::Recoverable,
            _ => Recovery::Unrecoverable,
        }
    }

    /// Queues a command frame without flushing, for coalesced sends.
    pub async fn feed(&mut self, command: &Command) -> Result<()> {
        if log_enabled!(Level::Debug) {
            debug!("[{}] Sending command: {command}", self.tag);
        }
        self.writer
            .as_mut()
            .ok_or(Error::NoConnect)?
            .feed(command)
            .await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.as_mut().ok_or(Error::NoConnect)?.flush().await
    }

    /// Next decoded reply; `None` means the peer closed the connection.
    pub async fn read_frame(&mut self) -> Option<Result<Value>> {
        let Some(reader) = self.reader.as_mut() else {
            return Some(Err(Error::NoConnect));
        };

        let result = reader.next().await;
        match &result {
            Some(Ok(value)) => {
                self.status = if reader.read_buffer().is_empty() {
                    ConnectionStatus::Authorized
                } else {
                    ConnectionStatus::PendingData
                };
                if log_enabled!(Level::Debug) {
                    debug!("[{}] Received result {value:?}", self.tag);
                }
            }
            Some(Err(err)) => {
                debug!("[{}] Receive error: {err}", self.tag);
                self.status = ConnectionStatus::Failed;
            }
            None => {
                debug!("[{}] Socket is closed", self.tag);
                self.status = ConnectionStatus::Failed;
            }
        }
        result
    }

    /// Non-blocking variant of [`read_frame`](Self::read_frame); `Poll::Pending`
    /// when no complete frame is buffered.
    pub fn try_read_frame(&mut self) -> Poll<Option<Result<Value>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Poll::Ready(Some(Err(Error::NoConnect)));
        };

        let waker = noop_waker_ref();
        let mut cx = Context::from_waker(waker);

        match Pin::new(reader).poll_next(&mut cx) {
            Poll::Ready(result) => {
                match &result {
                    Some(Ok(_)) => {
                        let buffered = self
                            .reader
                            .as_ref()
                            .is_some_and(|r| !r.read_buffer().is_empty());
                        self.status = if buffered {
                            ConnectionStatus::PendingData
                        } else {
                            ConnectionStatus::Authorized
                        };
                    }
                    _ => self.status = ConnectionStatus::Failed,
                }
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Single request-response exchange, for handshake and admin commands on
    /// an otherwise quiescent link.
    pub async fn call(&mut self, command: &Command) -> Result<Value> {
        self.feed(command).await?;
        self.flush().await?;
        match self.read_frame().await {
            Some(result) => result,
            None => Err(Error::NoConnect),
        }
    }

    /// `ROLE` query; true iff the node reports itself as master.
    pub async fn is_master(&mut self) -> Result<bool> {
        let reply = self.call(&cmd("ROLE").into()).await?;
        match reply.as_array()?.first() {
            Some(role) => Ok(role.as_str()? == "master"),
            None => Err(Error::BeGeneral),
        }
    }
}

/// Reads the AUTH secret: the first whitespace-terminated token of the
/// authfile's first line. The literal name `NONE` disables AUTH.
fn read_auth_secret(authfile: &str) -> Result<Option<String>> {
    if authfile == AUTHFILE_NONE {
        return Ok(None);
    }

    let content = std::fs::read_to_string(authfile)
        .map_err(|e| Error::Config(format!("cannot read authfile {authfile}: {e}")))?;
    match content.split_whitespace().next() {
        Some(secret) => Ok(Some(secret.to_owned())),
        None => Err(Error::Config(format!("authfile {authfile} is empty"))),
    }
}
