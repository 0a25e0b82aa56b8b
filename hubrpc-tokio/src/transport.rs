//! TCP transport: length-prefixed frames, one serialized write chain per socket.

use std::future::Future;
use std::io;
use std::sync::Arc;

use hubrpc_core::wire::{decode_body, frame_len, LEN_SIZE};
use hubrpc_core::{Message, WireFrame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::TransportError;

struct Outgoing {
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<io::Result<()>>>,
}

/// Clonable handle to the write side of one connection.
///
/// Every frame goes through one queue into one write loop, which writes the whole
/// frame and flushes before taking the next, so frames never interleave.
#[derive(Clone)]
pub struct ConnectionWriter {
    tx: mpsc::UnboundedSender<Outgoing>,
    label: Arc<str>,
}

impl ConnectionWriter {
    /// Create the handle and the write loop future. The loop ends when every handle is
    /// dropped or a write fails; the caller decides where it runs.
    pub fn new<Wr>(writer: Wr, label: impl Into<String>) -> (Self, impl Future<Output = ()> + Send + 'static)
    where
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let label: Arc<str> = Arc::from(label.into());
        let handle = Self {
            tx,
            label: label.clone(),
        };
        (handle, write_loop(writer, rx, label))
    }

    /// Queue a frame and wait until it is written.
    pub async fn send(&self, msg: Message) -> Result<(), TransportError> {
        let bytes = msg.to_bytes()?;
        let (done, written) = oneshot::channel();
        self.tx
            .send(Outgoing {
                bytes,
                done: Some(done),
            })
            .map_err(|_| TransportError::WriterClosed)?;
        written.await.map_err(|_| TransportError::WriterClosed)??;
        Ok(())
    }

    /// Queue a frame without waiting. Failures are logged.
    pub fn send_detached(&self, msg: Message) {
        let opcode = msg.opcode();
        match msg.to_bytes() {
            Ok(bytes) => {
                if self.tx.send(Outgoing { bytes, done: None }).is_err() {
                    debug!(conn = %self.label, ?opcode, "writer closed, frame dropped");
                }
            }
            Err(err) => warn!(conn = %self.label, ?opcode, error = %err, "frame not encodable, dropped"),
        }
    }
}

async fn write_loop<Wr>(mut writer: Wr, mut rx: mpsc::UnboundedReceiver<Outgoing>, label: Arc<str>)
where
    Wr: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(out) = rx.recv().await {
        let result = write_frame_bytes(&mut writer, &out.bytes).await;
        let failed = result.as_ref().err().map(|e| e.to_string());
        match out.done {
            Some(done) => {
                let _ = done.send(result);
            }
            None => {
                if let Some(err) = &failed {
                    warn!(conn = %label, error = %err, "background write failed");
                }
            }
        }
        if failed.is_some() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame_bytes<Wr: AsyncWrite + Unpin>(writer: &mut Wr, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Read one frame. `Ok(None)` on clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireFrame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LEN_SIZE];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = frame_len(&prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_body(&body)?))
}

/// Read the next message, skipping frames that carry an unknown opcode or call id.
pub async fn read_message<R>(reader: &mut R, conn: &str) -> Result<Option<Message>, TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(frame) = read_frame(reader).await? else {
            return Ok(None);
        };
        match Message::from_wire(frame) {
            Ok(msg) => return Ok(Some(msg)),
            Err(err) => warn!(conn, error = %err, "dropping undecodable frame"),
        }
    }
}

/// Bind a listening socket. `*` binds every interface. Address reuse is enabled so a
/// restarted hub can take its old port while old connections linger in TIME_WAIT.
pub async fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let host = if host == "*" { "0.0.0.0" } else { host };
    let addr = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {host}")))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

pub async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
