//! The IPC message server (C5): a length-prefixed, bidirectional TCP transport serving many
//! simultaneous clients, each addressable by a stable `client_id`.
//!
//! One accept thread plus one reader thread per connection, all doing blocking I/O — this
//! matches the concurrency model in §5 ("IO threads inside the IPC server ... block on
//! socket read/accept") and feeds the scheduler through a lock-free queue it drains each
//! tick. Each client additionally owns a bounded outbox drained by its own writer thread, so
//! a slow or wedged client can never stall the scheduler (§4.8: "the scheduler must not
//! block waiting on any client").

pub mod message;

use std::{
    collections::HashMap,
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub use message::Message;

/// One inbound message paired with the client it arrived from.
pub struct InboundMessage {
    pub client_id: u32,
    pub message: Message,
}

/// Capacity of a single client's outbox. Once full, further sends to that client are
/// dropped rather than blocking the scheduler thread.
const OUTBOX_CAPACITY: usize = 1024;

struct ClientHandle {
    outbox: Sender<Vec<u8>>,
}

/// Listens on `address:port`, accepting connections until dropped.
pub struct IpcServer {
    clients: Arc<Mutex<HashMap<u32, ClientHandle>>>,
    inbound_rx: Receiver<InboundMessage>,
    local_addr: std::net::SocketAddr,
}

impl IpcServer {
    pub fn start(address: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((address, port))?;
        let local_addr = listener.local_addr()?;
        let clients: Arc<Mutex<HashMap<u32, ClientHandle>>> = Arc::new(Mutex::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();

        let accept_clients = clients.clone();
        std::thread::Builder::new()
            .name("resource-ipc-accept".to_string())
            .spawn(move || accept_loop(listener, accept_clients, inbound_tx))
            .expect("failed to spawn IPC accept thread");

        Ok(Self { clients, inbound_rx, local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Drains every inbound message queued since the last call.
    pub fn drain_inbound(&self) -> Vec<InboundMessage> {
        self.inbound_rx.try_iter().collect()
    }

    /// Sends `message` to `client_id`. Returns `false` if the client has disconnected (or
    /// its outbox is saturated); never blocks.
    pub fn send(&self, client_id: u32, message: &Message) -> bool {
        let clients = self.clients.lock();
        match clients.get(&client_id) {
            Some(handle) => handle.outbox.try_send(message.encode()).is_ok(),
            None => false,
        }
    }

    /// Sends `message` to every currently connected client, best-effort.
    pub fn broadcast(&self, message: &Message) {
        let encoded = message.encode();
        let clients = self.clients.lock();
        for handle in clients.values() {
            let _ = handle.outbox.try_send(encoded.clone());
        }
    }

    pub fn connected_client_count(&self) -> usize {
        self.clients.lock().len()
    }
}

fn accept_loop(
    listener: TcpListener,
    clients: Arc<Mutex<HashMap<u32, ClientHandle>>>,
    inbound_tx: Sender<InboundMessage>,
) {
    let next_client_id = AtomicU32::new(1);
    for incoming in listener.incoming() {
        let Ok(stream) = incoming else { continue };
        let client_id = next_client_id.fetch_add(1, Ordering::SeqCst);
        spawn_client(client_id, stream, clients.clone(), inbound_tx.clone());
    }
}

fn spawn_client(
    client_id: u32,
    stream: TcpStream,
    clients: Arc<Mutex<HashMap<u32, ClientHandle>>>,
    inbound_tx: Sender<InboundMessage>,
) {
    let Ok(write_stream) = stream.try_clone() else { return };
    let (outbox_tx, outbox_rx) = crossbeam_channel::bounded::<Vec<u8>>(OUTBOX_CAPACITY);
    clients.lock().insert(client_id, ClientHandle { outbox: outbox_tx });

    std::thread::Builder::new()
        .name(format!("resource-ipc-writer-{client_id}"))
        .spawn(move || writer_loop(write_stream, outbox_rx))
        .expect("failed to spawn IPC writer thread");

    std::thread::Builder::new()
        .name(format!("resource-ipc-reader-{client_id}"))
        .spawn(move || {
            reader_loop(client_id, stream, &inbound_tx);
            clients.lock().remove(&client_id);
            tracing::info!(client_id, "client disconnected");
        })
        .expect("failed to spawn IPC reader thread");
}

fn reader_loop(client_id: u32, stream: TcpStream, inbound_tx: &Sender<InboundMessage>) {
    let mut reader = BufReader::new(stream);
    loop {
        match message::Message::read_from(&mut reader) {
            Ok(Some(message)) => {
                if inbound_tx.send(InboundMessage { client_id, message }).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(client_id, %error, "malformed frame from client, disconnecting");
                return;
            }
        }
    }
}

fn writer_loop(mut stream: TcpStream, outbox_rx: Receiver<Vec<u8>>) {
    use std::io::Write;
    for frame in outbox_rx {
        if stream.write_all(&frame).is_err() {
            return;
        }
    }
}
