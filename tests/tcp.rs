use futures::{SinkExt, StreamExt};
use hot_potato_lock::{
    message::{ErrorKind, Reply, Request, Response},
    registry::{PeerHandle, PeerRegistry},
    remote::{RemoteInvoker, TcpInvoker},
    server::Server,
    DistributedLock, RemoteError, TokenState,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{Framed, LinesCodec};

async fn serve(lock: Arc<DistributedLock>) -> (SocketAddr, JoinHandle<()>) {
    let server = Server::bind("127.0.0.1:0", lock).await.unwrap();
    let address = server.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (address, task)
}

async fn pair() -> (Arc<DistributedLock>, Arc<DistributedLock>, SocketAddr, Vec<JoinHandle<()>>) {
    let invoker = Arc::new(TcpInvoker::default());
    let one = Arc::new(DistributedLock::new(1, PeerRegistry::new(), invoker.clone()));
    let two = Arc::new(DistributedLock::new(2, PeerRegistry::new(), invoker));

    let (address_one, task_one) = serve(one.clone()).await;
    let (address_two, task_two) = serve(two.clone()).await;

    one.register_peer(2, address_two.to_string()).await;
    two.register_peer(1, address_one.to_string()).await;
    one.initialize().await;
    two.initialize().await;

    (one, two, address_one, vec![task_one, task_two])
}

#[tokio::test]
async fn token_travels_over_tcp() {
    let (one, two, _, tasks) = pair().await;
    assert_eq!(one.state().await, TokenState::TokenIdle);
    assert_eq!(two.state().await, TokenState::NoToken);

    timeout(Duration::from_secs(5), two.acquire())
        .await
        .expect("peer 2 never got the token");
    assert_eq!(two.state().await, TokenState::TokenHeld);
    assert_eq!(one.state().await, TokenState::NoToken);

    two.release().await.unwrap();
    assert_eq!(two.state().await, TokenState::TokenIdle);

    timeout(Duration::from_secs(5), one.acquire())
        .await
        .expect("peer 1 never got the token back");
    assert_eq!(one.state().await, TokenState::TokenHeld);
    assert_eq!(two.state().await, TokenState::NoToken);

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn check_answers_with_identity() {
    let (_, _, address_one, tasks) = pair().await;
    let handle = PeerHandle {
        id: 1,
        address: address_one.to_string(),
    };

    let reply = TcpInvoker::default().call(&handle, Request::Check).await;
    assert_eq!(reply, Ok(Reply::Identity(1)));

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn malformed_line_gets_an_error_reply() {
    let (_, _, address_one, tasks) = pair().await;

    let stream = TcpStream::connect(address_one).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines.send("give me the token").await.unwrap();
    let line = lines.next().await.unwrap().unwrap();

    match Response::from_json_string(&line).unwrap() {
        Response::Err { kind, .. } => assert_eq!(kind, ErrorKind::Malformed),
        other => panic!("unexpected response {other:?}"),
    }

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let handle = PeerHandle {
        id: 4,
        address: address.to_string(),
    };
    let result = TcpInvoker::new(Duration::from_millis(500))
        .call(&handle, Request::Check)
        .await;

    assert!(matches!(result, Err(RemoteError::Unreachable { peer: 4, .. })));
}
