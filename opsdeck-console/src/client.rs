use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::Notify;
use tracing::debug;

use opsdeck_core::envelope::Envelope;

pub const DEFAULT_CLIENT_QUEUE: usize = 256;

/// One attached subscriber. The outbound queue is bounded with a
/// drop-oldest discipline so a slow client can never stall the pump.
pub struct SessionClient {
    pub id: String,
    capacity: usize,
    queue: Mutex<VecDeque<String>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SessionClient {
    pub fn new(id: String, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a serialized envelope; evicts the oldest message when
    /// full. Returns false once the client is closed.
    pub fn enqueue(&self, text: String) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut queue = self.queue.lock().expect("client queue lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                debug!(event = "client_queue_overflow", client_id = %self.id);
            }
            queue.push_back(text);
        }
        self.notify.notify_one();
        true
    }

    /// Await the next outbound message. Returns None once the client
    /// is closed and its queue is drained.
    pub async fn next(&self) -> Option<String> {
        loop {
            {
                let mut queue = self.queue.lock().expect("client queue lock");
                if let Some(text) = queue.pop_front() {
                    return Some(text);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit when the consumer is not yet
            // parked, so the single reader can never miss the close.
            self.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Set of attached clients for one session.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Arc<SessionClient>>>,
    closed: AtomicBool,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false when the registry has already been closed.
    pub fn attach(&self, client: Arc<SessionClient>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.clients
            .write()
            .expect("client registry lock")
            .insert(client.id.clone(), client);
        true
    }

    pub fn detach(&self, client_id: &str) {
        if let Some(client) = self
            .clients
            .write()
            .expect("client registry lock")
            .remove(client_id)
        {
            client.close();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().expect("client registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize once, enqueue to every attached client. Never blocks
    /// on any client's queue.
    pub fn broadcast(&self, envelope: &Envelope) {
        let text = envelope.to_json();
        let clients: Vec<_> = self
            .clients
            .read()
            .expect("client registry lock")
            .values()
            .cloned()
            .collect();
        for client in clients {
            client.enqueue(text.clone());
        }
    }

    /// Close every client and clear the set; repeated calls are no-ops.
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<_> = {
            let mut clients = self.clients.write().expect("client registry lock");
            clients.drain().map(|(_, c)| c).collect()
        };
        for client in drained {
            client.close();
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
