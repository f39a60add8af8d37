use crate::{
    lock::DistributedLock,
    log,
    message::{ErrorKind, Request, Response},
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use std::{error::Error, net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

/// Accepts remote calls from other peers and runs them on the local lock.
pub struct Server {
    listener: TcpListener,
    lock: Arc<DistributedLock>,
}

impl Server {
    pub async fn bind(
        address: &str,
        lock: Arc<DistributedLock>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, lock })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Box<dyn Error + Send + Sync>> {
        Ok(self.listener.local_addr()?)
    }

    async fn handle(
        stream: TcpStream,
        address: SocketAddr,
        lock: Arc<DistributedLock>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut lines = Framed::new(stream, LinesCodec::new());

        while let Some(line) = lines.next().await {
            let line = line?;
            let response = match Request::from_json_string(&line) {
                Ok(request) => {
                    log::debug(&cformat!(
                        "Serving {} from <bold>{address}</bold>.",
                        request.describe()
                    ));
                    lock.handle(request).await
                }
                Err(e) => {
                    log::warn(&cformat!(
                        "Received a <bold>malformed</bold> request from <bold>{address}</bold>."
                    ));
                    Response::err(ErrorKind::Malformed, e.to_string())
                }
            };

            lines.send(response.to_json_string()?).await?;
        }

        Ok(())
    }

    /// Function that serves connections until the task running it is aborted.
    pub async fn run(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        loop {
            let (stream, address) = self.listener.accept().await?;
            let lock = self.lock.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle(stream, address, lock).await {
                    log::error(&format!("{e}"));
                }
            });
        }
    }
}
