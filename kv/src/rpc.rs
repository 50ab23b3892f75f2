//! A generic request/reply RPC transport over TCP. Each call opens a fresh
//! connection, writes one length-prefixed JSON request, reads back one
//! length-prefixed JSON reply, and closes -- no connection pooling, no
//! multiplexing. The framing mirrors `codec::bytes_codec::BytesCodec`'s
//! length-prefixed `serde_json` encoding, just carried over a socket
//! instead of an in-memory buffer.
//!
//! The wire transport itself is an external collaborator as far as the 2PC
//! protocol is concerned (any typed request/reply RPC would do); this
//! module exists so the rest of the crate has one to call.

use std::future::Future;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CResult, Error};

async fn write_message<W: AsyncWriteExt + Unpin, T: Serialize>(w: &mut W, value: &T) -> std::io::Result<()> {
    let payload = serde_json::to_vec(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    w.write_u64(payload.len() as u64).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

async fn read_message<R: AsyncReadExt + Unpin, T: DeserializeOwned>(r: &mut R) -> std::io::Result<T> {
    let len = r.read_u64().await?;
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Sends `request` to `addr` and returns the decoded reply. A connection
/// failure, or any I/O error while sending or receiving, is a transport
/// error under section 7 -- the caller decides what that means for the vote
/// it's collecting (a "no" during Prepare, a "must retry" during Commit).
pub async fn call<Req: Serialize, Resp: DeserializeOwned>(addr: &str, request: &Req) -> CResult<Resp> {
    let mut stream = TcpStream::connect(addr).await.map_err(Error::Io)?;
    write_message(&mut stream, request).await.map_err(Error::Io)?;
    read_message(&mut stream).await.map_err(Error::Io)
}

/// Serves request/reply connections accepted on `listener`, dispatching
/// each request to `handler` on its own task and writing back the reply.
/// Runs until the listener errors (which in practice means the process is
/// shutting down).
pub async fn serve<Req, Resp, F, Fut>(listener: TcpListener, handler: F) -> CResult<()>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
{
    loop {
        let (mut stream, peer) = listener.accept().await.map_err(Error::Io)?;
        let handler = handler.clone();
        tokio::spawn(async move {
            let request: Req = match read_message(&mut stream).await {
                Ok(req) => req,
                Err(err) => {
                    log::warn!("failed to read request from {}: {}", peer, err);
                    return;
                }
            };
            let reply = handler(request).await;
            if let Err(err) = write_message(&mut stream, &reply).await {
                log::warn!("failed to write reply to {}: {}", peer, err);
            }
        });
    }
}
