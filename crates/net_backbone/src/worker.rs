//! Worker threads: one queue, an ordered list of managers, one dispatch loop.
//!
//! A worker's loop is a plain blocking consumer. It takes one message at a
//! time and offers it to the registered managers, first match wins. Messages
//! nobody claims are logged and dropped. `Execute` messages are run directly
//! by the loop. `Shutdown` is routed to the managers like everything else and
//! then ends the loop; the same rule holds for every worker, including the
//! main worker that runs on the caller's thread.

use crate::error::ServerError;
use crate::manager::Manager;
use crate::message::{Message, SystemMessage};
use crate::queue::MessageQueue;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type ManagerList = Arc<RwLock<Vec<Arc<dyn Manager>>>>;

pub struct Worker {
    name: String,
    queue: Arc<MessageQueue>,
    managers: ManagerList,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(MessageQueue::new()),
            managers: Arc::new(RwLock::new(Vec::new())),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a manager; it is consulted after every manager added before it.
    pub fn add_manager(&self, manager: Arc<dyn Manager>) {
        debug!(worker = %self.name, manager = manager.name(), "registering manager");
        self.managers.write().push(manager);
    }

    pub fn message_queue(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    /// Number of connections currently reporting into this worker's queue.
    ///
    /// Connections only hold weak references to the queue, so this is the
    /// weak count.
    pub fn assignment_count(&self) -> usize {
        Arc::weak_count(&self.queue)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.queue.is_shut_down()
    }

    /// Spawns the worker thread. Later calls do nothing.
    pub fn start(&self) -> Result<(), ServerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let name = self.name.clone();
        let queue = self.queue.clone();
        let managers = self.managers.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(&name, &queue, &managers))
            .map_err(|e| {
                self.started.store(false, Ordering::Release);
                ServerError::Internal(format!("failed to spawn worker {}: {e}", self.name))
            })?;

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Runs the dispatch loop on the calling thread until a shutdown message
    /// has been processed.
    pub fn run(&self) {
        self.started.store(true, Ordering::Release);
        run_loop(&self.name, &self.queue, &self.managers);
    }

    /// Queues a shutdown message. Repeated calls are ignored.
    pub fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if self
            .queue
            .enqueue(Message::System(SystemMessage::Shutdown))
            .is_err()
        {
            trace!(worker = %self.name, "queue already closed");
        }
    }

    /// Waits for the worker thread to exit. Safe to call more than once.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        let Some(handle) = handle else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            // Joining ourselves would never return; the loop exits on its own.
            return;
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

fn run_loop(name: &str, queue: &MessageQueue, managers: &RwLock<Vec<Arc<dyn Manager>>>) {
    debug!(worker = name, "worker loop started");

    while let Some(message) = queue.dequeue() {
        let stop = message.is_shutdown();

        match message {
            Message::System(SystemMessage::Execute(task)) => task.run(),
            message => {
                // Snapshot so managers can be added while a handler runs.
                let snapshot = managers.read().clone();
                dispatch(name, &snapshot, &message);
            }
        }

        if stop {
            break;
        }
    }

    queue.shutdown();
    debug!(worker = name, "worker loop stopped");
}

/// Offers `message` to each manager that supports its type, in order, until
/// one of them handles it.
pub(crate) fn dispatch(worker: &str, managers: &[Arc<dyn Manager>], message: &Message) -> bool {
    let kind = message.message_type();

    for manager in managers
        .iter()
        .filter(|manager| manager.supported_types().contains(&kind))
    {
        if manager.process_message(message) {
            trace!(worker, manager = manager.name(), subtype = message.subtype(), "message handled");
            return true;
        }
    }

    if message.is_shutdown() {
        debug!(worker, "shutdown message reached no manager");
    } else {
        warn!(worker, kind = ?kind, subtype = message.subtype(), "message not handled, discarding");
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, ConnectionRole};
    use crate::message::{
        ClientMessage, ClosedConnection, ConnectionMessage, InternalMessage, MessageType,
    };
    use crossbeam::channel::{self, Receiver, Sender};
    use std::sync::Weak;
    use std::time::Duration;

    struct Recorder {
        label: &'static str,
        types: Vec<MessageType>,
        accept: bool,
        seen: Sender<(&'static str, &'static str)>,
    }

    impl Recorder {
        fn new(
            label: &'static str,
            types: &[MessageType],
            accept: bool,
        ) -> (Arc<Self>, Receiver<(&'static str, &'static str)>) {
            let (seen, rx) = channel::unbounded();
            let recorder = Arc::new(Self {
                label,
                types: types.to_vec(),
                accept,
                seen,
            });
            (recorder, rx)
        }
    }

    impl Manager for Recorder {
        fn supported_types(&self) -> &[MessageType] {
            &self.types
        }

        fn process_message(&self, message: &Message) -> bool {
            let _ = self.seen.send((self.label, message.subtype()));
            self.accept
        }
    }

    fn closed_message() -> Message {
        Message::Connection(ConnectionMessage::Closed(ClosedConnection {
            id: ConnectionId::from_raw(7),
            role: ConnectionRole::Client,
            remote_addr: "127.0.0.1:1".parse().unwrap(),
            handle: Weak::new(),
        }))
    }

    fn world_notification() -> Message {
        Message::Internal(InternalMessage::WorldNotification {
            address: "127.0.0.1:1".parse().unwrap(),
        })
    }

    #[test]
    fn only_the_manager_claiming_the_type_is_invoked() {
        let (a, a_seen) = Recorder::new("a", &[MessageType::Packet], true);
        let (b, b_seen) = Recorder::new("b", &[MessageType::Connection], true);

        let worker = Worker::new("dispatch-test");
        worker.add_manager(a);
        worker.add_manager(b);
        worker.start().unwrap();

        worker.message_queue().enqueue(closed_message()).unwrap();
        worker.shutdown();
        worker.join();

        assert_eq!(
            b_seen.recv_timeout(Duration::from_secs(1)).unwrap(),
            ("b", "connection-closed")
        );
        assert!(a_seen.try_recv().is_err());
    }

    #[test]
    fn declined_messages_fall_through_to_the_next_manager() {
        let (first, first_seen) = Recorder::new("first", &[MessageType::Client], false);
        let (second, second_seen) = Recorder::new("second", &[MessageType::Client], true);
        let (third, third_seen) = Recorder::new("third", &[MessageType::Client], true);

        let managers: Vec<Arc<dyn Manager>> = vec![first as Arc<dyn Manager>, second, third];
        let message = Message::Client(ClientMessage::Disconnected {
            connection_id: "lobby".into(),
        });

        assert!(dispatch("test", &managers, &message));
        assert!(first_seen.try_recv().is_ok());
        assert!(second_seen.try_recv().is_ok());
        assert!(third_seen.try_recv().is_err());
    }

    #[test]
    fn unclaimed_messages_are_dropped() {
        let (only, seen) = Recorder::new("only", &[MessageType::Packet], true);
        let managers: Vec<Arc<dyn Manager>> = vec![only as Arc<dyn Manager>];

        assert!(!dispatch("test", &managers, &world_notification()));
        assert!(seen.try_recv().is_err());
    }

    #[test]
    fn shutdown_is_routed_then_stops_the_loop() {
        let (system, seen) = Recorder::new("system", &[MessageType::System], false);
        let worker = Worker::new("shutdown-test");
        worker.add_manager(system);
        worker.start().unwrap();

        worker.shutdown();
        worker.join();

        assert_eq!(seen.recv_timeout(Duration::from_secs(1)).unwrap(), ("system", "shutdown"));
        assert!(!worker.is_running());
        assert!(worker.message_queue().enqueue(world_notification()).is_err());
    }

    #[test]
    fn shutdown_and_join_are_idempotent() {
        let worker = Worker::new("idempotent");
        worker.start().unwrap();
        worker.start().unwrap();

        worker.shutdown();
        worker.shutdown();
        worker.join();
        worker.join();
    }

    #[test]
    fn execute_messages_run_on_the_worker_thread() {
        let worker = Worker::new("exec-worker");
        worker.start().unwrap();

        let (tx, rx) = channel::bounded(1);
        worker
            .message_queue()
            .enqueue(Message::execute(move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            }))
            .unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap().as_deref(),
            Some("exec-worker")
        );
    }

    #[test]
    fn main_worker_runs_on_the_calling_thread() {
        let worker = Worker::new("main");
        let queue = worker.message_queue();
        queue.enqueue(world_notification()).unwrap();
        worker.shutdown();

        worker.run();
        assert!(queue.is_shut_down());
    }

    #[test]
    fn assignment_count_tracks_weak_holders() {
        let worker = Worker::new("counting");
        assert_eq!(worker.assignment_count(), 0);

        let first = Arc::downgrade(&worker.message_queue());
        let second = Arc::downgrade(&worker.message_queue());
        assert_eq!(worker.assignment_count(), 2);

        drop(first);
        assert_eq!(worker.assignment_count(), 1);
        drop(second);
    }
}
