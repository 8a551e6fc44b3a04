//! One accepted Modbus TCP connection

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::ClientStats;
use crate::handler::TransactionHandler;
use crate::protocol::MbapCodec;

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Idle,
    Shutdown,
    Malformed,
    Io,
}

/// Serve requests until the peer leaves, the link idles out, a malformed
/// frame arrives, or the server is cancelled between transactions
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<TransactionHandler>,
    stats: Arc<ClientStats>,
    idle_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> CloseReason {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("{}: set_nodelay failed: {}", peer, e);
    }
    let mut framed = Framed::new(stream, MbapCodec);
    let _slot = stats.track(peer.ip());

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Shutdown,
            next = next_frame(&mut framed, idle_timeout) => next,
        };

        let adu = match next {
            None => break CloseReason::Idle,
            Some(None) => break CloseReason::PeerClosed,
            Some(Some(Ok(adu))) => adu,
            Some(Some(Err(e))) => {
                warn!("{}: closing connection, malformed frame: {}", peer, e);
                break CloseReason::Malformed;
            },
        };

        // Runs to completion even if a stop arrives meanwhile
        let handled = handler.handle(adu);
        stats.record(peer.ip(), handled.access);
        if let Err(e) = framed.send(handled.response).await {
            warn!("{}: write failed: {}", peer, e);
            break CloseReason::Io;
        }
    };

    debug!("{}: connection closed ({:?})", peer, reason);
    reason
}

/// `None` on idle timeout, otherwise the stream's next item
async fn next_frame(
    framed: &mut Framed<TcpStream, MbapCodec>,
    idle_timeout: Option<Duration>,
) -> Option<Option<Result<crate::protocol::RequestAdu, crate::error::FrameError>>> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, framed.next()).await.ok(),
        None => Some(framed.next().await),
    }
}
