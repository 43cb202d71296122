use std::net::SocketAddr;

use byteorder::{ByteOrder, LittleEndian};
use quinn::{Connecting, ConnectionError, RecvStream, SendStream};
use tracing::{debug, debug_span, trace, Instrument};

use super::{wire::WireMessage, MAX_FRAME_LEN, SERVER_NAME};
use crate::error::{Error, Result};

/// Links are the QUIC connections between clients, the broker and workers.
/// Each remote call runs on its own bidirectional stream, so one link can
/// carry any number of calls at once.
///
/// Can be cloned to obtain another handle to the same link.
#[derive(Clone)]
pub struct Link {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Link {
    /// Dials `remote` from `endpoint`.
    pub async fn connect(endpoint: &quinn::Endpoint, remote: SocketAddr) -> Result<Self> {
        let span = debug_span!("link", remote = %remote);
        async move {
            debug!("establishing QUIC connection");
            let conn = endpoint.connect(remote, SERVER_NAME)?.await?;
            debug!("connected via QUIC");
            Ok::<_, Error>(Link {
                conn,
                remote_addr: remote,
            })
        }
        .instrument(span)
        .await
    }

    /// Completes a connection accepted by a server endpoint.
    pub async fn accept(in_progress: Connecting) -> Result<Self> {
        let remote_addr = in_progress.remote_address();
        let conn = in_progress.await?;
        debug!(remote = %remote_addr, "accepted QUIC connection");
        Ok(Link { conn, remote_addr })
    }

    /// Sends one request and waits for its response.
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: WireMessage,
        Resp: WireMessage,
    {
        let (tx, rx) = self.conn.open_bi().await?;
        let mut tx = FrameSendStream::new(tx);
        let mut rx = FrameRecvStream::new(rx);
        tx.send(&request.encode()?).await?;
        tx.finish().await?;
        Resp::decode(&rx.receive().await?)
    }

    /// Waits for the peer to open its next call. Returns `None` once the peer
    /// has closed the link.
    pub async fn next_call(&self) -> Result<Option<PendingCall>> {
        match self.conn.accept_bi().await {
            Ok((tx, rx)) => Ok(Some(PendingCall {
                tx,
                rx,
                remote_addr: self.remote_addr,
            })),
            Err(
                ConnectionError::ApplicationClosed(_)
                | ConnectionError::ConnectionClosed(_)
                | ConnectionError::LocallyClosed,
            ) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn id(&self) -> usize {
        self.conn.stable_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Closes the link; calls still in flight on either side fail.
    pub fn close(&self, reason: &[u8]) {
        self.conn.close(0u32.into(), reason);
    }
}

/// A call whose request has not been read yet.
pub struct PendingCall {
    tx: SendStream,
    rx: RecvStream,
    remote_addr: SocketAddr,
}

impl PendingCall {
    /// Reads and decodes the request, handing back the means to answer it.
    pub async fn read<Req: WireMessage>(self) -> Result<(Req, Responder)> {
        let mut rx = FrameRecvStream::new(self.rx);
        let request = Req::decode(&rx.receive().await?)?;
        trace!(remote = %self.remote_addr, "received call");
        Ok((request, Responder {
            reply: FrameSendStream::new(self.tx),
        }))
    }
}

/// The stream a call's response goes back on.
pub struct Responder {
    reply: FrameSendStream,
}

impl Responder {
    pub async fn respond<Resp: WireMessage>(mut self, response: &Resp) -> Result<()> {
        self.reply.send(&response.encode()?).await?;
        // resolves once the peer has acknowledged the whole response
        self.reply.finish().await
    }
}

/// Writes `len | payload` frames.
pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(Error::FrameTooLarge {
                len: payload.len() as u64,
                max: MAX_FRAME_LEN as u64,
            })?;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, len);
        self.0.write_all(&len_buf).await?;
        self.0.write_all(payload).await?;
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<()> {
        self.0.finish().await?;
        Ok(())
    }
}

/// Reads `len | payload` frames.
pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.0.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                len: len as u64,
                max: MAX_FRAME_LEN as u64,
            });
        }
        let mut msg_buf = vec![0u8; len as usize];
        self.0.read_exact(&mut msg_buf).await?;
        Ok(msg_buf)
    }
}
