//! Module that performs remote calls on other peers' locks.

use crate::{
    error::RemoteError,
    message::{PeerId, Reply, Request, Response},
    registry::PeerHandle,
};
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, LinesCodec};

/// One synchronous round trip to a peer.
pub trait RemoteInvoker: Send + Sync {
    fn call<'a>(
        &'a self,
        peer: &'a PeerHandle,
        request: Request,
    ) -> BoxFuture<'a, Result<Reply, RemoteError>>;
}

/// Function that turns a peer's tagged answer into a `Result`.
pub fn into_result(peer: PeerId, response: Response) -> Result<Reply, RemoteError> {
    match response {
        Response::Ok(reply) => Ok(reply),
        Response::Err { kind, details } => Err(RemoteError::Remote {
            peer,
            kind,
            details,
        }),
    }
}

/// Invoker that opens one TCP connection per call and exchanges one JSON line each way.
#[derive(Debug, Clone)]
pub struct TcpInvoker {
    pub connect_timeout: Duration,
}

impl Default for TcpInvoker {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl TcpInvoker {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn invoke(&self, peer: &PeerHandle, request: Request) -> Result<Reply, RemoteError> {
        let unreachable = |reason: String| RemoteError::Unreachable {
            peer: peer.id,
            reason,
        };

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&peer.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable("connection attempt timed out".to_string())),
        };
        let mut lines = Framed::new(stream, LinesCodec::new());

        let line = request
            .to_json_string()
            .map_err(|e| unreachable(format!("couldn't encode {}: {e}", request.method())))?;
        lines
            .send(line)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let response = match lines.next().await {
            Some(Ok(line)) => Response::from_json_string(&line)
                .map_err(|e| unreachable(format!("garbled reply: {e}")))?,
            Some(Err(e)) => return Err(unreachable(e.to_string())),
            None => return Err(unreachable("connection closed before replying".to_string())),
        };

        into_result(peer.id, response)
    }
}

impl RemoteInvoker for TcpInvoker {
    fn call<'a>(
        &'a self,
        peer: &'a PeerHandle,
        request: Request,
    ) -> BoxFuture<'a, Result<Reply, RemoteError>> {
        self.invoke(peer, request).boxed()
    }
}
