use docdb_driver::codec::JsonCodec;
use docdb_driver::document::{self, Document};
use docdb_driver::frame::{IncomingFrame, OutgoingFrame};
use docdb_driver::operation::Operation;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::Framed;

/// How the server reacts to a single frame.
pub enum Action {
    Reply(Vec<Document>),
    /// Send nothing back, the way a server treats an unacknowledged write.
    Silence,
    /// Close the connection the frame arrived on without replying.
    Hangup,
}

impl Action {
    /// Reply with a single document.
    pub fn document(value: Value) -> Action {
        Action::Reply(document::from_value(value).into_iter().collect())
    }
}

type Handler = Arc<dyn Fn(&OutgoingFrame) -> Action + Send + Sync>;

/// An in-process server that speaks the JSON codec and answers according to a handler.
/// Every frame it receives is recorded.
pub struct MockServer {
    address: String,
    received: Arc<Mutex<Vec<OutgoingFrame>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> MockServer
    where
        F: Fn(&OutgoingFrame) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let received = Arc::new(Mutex::new(vec![]));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);

        let task = tokio::spawn({
            let received = received.clone();
            let accepted = accepted.clone();
            async move {
                // dropped along with the accept loop, which closes every connection
                let mut connections = JoinSet::new();
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    connections.spawn(serve(socket, handler.clone(), received.clone()));
                }
            }
        });

        MockServer {
            address,
            received,
            accepted,
            task,
        }
    }

    /// A server that acknowledges every write, answers commands with `ok: 1` and queries with no documents.
    pub async fn acknowledging() -> MockServer {
        MockServer::start(acknowledge).await
    }

    pub fn address(&self) -> String {
        self.address.clone()
    }

    pub fn received(&self) -> Vec<OutgoingFrame> {
        self.received.lock().unwrap().clone()
    }

    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` frames have arrived, panicking after 5 seconds.
    pub async fn wait_for_received(&self, count: usize) -> Vec<OutgoingFrame> {
        let wait = async {
            loop {
                let received = self.received();
                if received.len() >= count {
                    return received;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("server never received {count} frames, got {:?}", self.received()))
    }

    /// Stop accepting connections and close every open one.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The default behaviour: writes are silent, confirmations report one affected document.
pub fn acknowledge(frame: &OutgoingFrame) -> Action {
    match &frame.operation {
        Operation::Insert { .. } | Operation::Update { .. } | Operation::Remove { .. } => Action::Silence,
        Operation::Command { command, .. } if command.contains_key("getlasterror") => {
            Action::document(json!({"ok": 1, "n": 1, "err": null}))
        }
        Operation::Command { .. } => Action::document(json!({"ok": 1})),
        Operation::Query { .. } => Action::Reply(vec![]),
    }
}

async fn serve(socket: TcpStream, handler: Handler, received: Arc<Mutex<Vec<OutgoingFrame>>>) {
    socket.set_nodelay(true).ok();
    let mut framed = Framed::new(socket, JsonCodec::<OutgoingFrame, IncomingFrame>::new());
    while let Some(Ok(frame)) = framed.next().await {
        received.lock().unwrap().push(frame.clone());
        match (handler.as_ref())(&frame) {
            Action::Reply(documents) => {
                let reply = IncomingFrame::with_documents(frame.request_id, &documents);
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
            Action::Silence => {}
            Action::Hangup => return,
        }
    }
}
