/// Terminal orchestrator — wires the node pool, the executor, and the
/// BLE transport together.
///
/// The terminal listens to the pool through a bounded mailbox: packets
/// become executor touches while a routine runs, node arrivals and
/// departures update the roster. Reassembled BLE writes load, start, or
/// stop executors; each run's event stream is drained by a worker that
/// serializes events onto the notify queue and closes the run with a
/// result transcript.

use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use thiserror::Error;

use crate::ble;
use crate::comm::{self, CommandError, DeviceMessage, RoutineResult, TerminalCommand};
use crate::executor::{Event, Executor, ExecutorError, NodeConfig, Sender, Strategy};
use crate::protocol::{Packet, PacketType};
use crate::server::{Listener, Server};

/// Depth of the mailbox fed by pool listeners.
const MAILBOX_DEPTH: usize = 16;

/// Depth of the serialized-notification queue.
const NOTIFY_QUEUE: usize = 8;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("executor is already running")]
    ExecutorRunning,
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

enum Mail {
    Packet(Packet),
    NodeUp(u16),
    NodeDown(u16),
    Shutdown,
}

struct ExecSlot {
    executing: bool,
    executor: Option<Executor>,
}

struct Inner {
    server: Server,
    exec: Mutex<ExecSlot>,
    mail_tx: SyncSender<Mail>,
    mail_rx: Mutex<Option<Receiver<Mail>>>,
    notify_tx: SyncSender<Vec<u8>>,
    notify_rx: Mutex<Option<Receiver<Vec<u8>>>>,
    roster: Mutex<HashSet<u16>>,
}

/// Handle to the terminal. Clones share state; the clone handed to the
/// fragmenter serves as its `Client`.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<Inner>,
}

impl Terminal {
    /// Build a terminal over a pool server and register it as the
    /// server's listener.
    pub fn new(server: Server) -> Terminal {
        let (mail_tx, mail_rx) = mpsc::sync_channel(MAILBOX_DEPTH);
        let (notify_tx, notify_rx) = mpsc::sync_channel(NOTIFY_QUEUE);
        let terminal = Terminal {
            inner: Arc::new(Inner {
                server,
                exec: Mutex::new(ExecSlot {
                    executing: false,
                    executor: None,
                }),
                mail_tx: mail_tx.clone(),
                mail_rx: Mutex::new(Some(mail_rx)),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
                roster: Mutex::new(HashSet::new()),
            }),
        };
        terminal
            .inner
            .server
            .add_listener(Arc::new(Mailbox { tx: mail_tx }));
        terminal
    }

    /// The serialized-notification stream for the BLE notify pump. Can
    /// be taken once.
    pub fn notifications(&self) -> Option<Receiver<Vec<u8>>> {
        self.inner.notify_rx.lock().unwrap().take()
    }

    /// Snapshot of nodes currently on the roster.
    pub fn nodes(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.inner.roster.lock().unwrap().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Process mailbox traffic until shutdown. Blocks the caller.
    pub fn run(&self) {
        let mailbox = match self.inner.mail_rx.lock().unwrap().take() {
            Some(mailbox) => mailbox,
            None => return,
        };
        for mail in mailbox {
            match mail {
                Mail::Packet(pkt) => self.handle_packet(pkt),
                Mail::NodeUp(id) => {
                    self.inner.roster.lock().unwrap().insert(id);
                    log::info!("node joined: {id}");
                }
                Mail::NodeDown(id) => {
                    self.inner.roster.lock().unwrap().remove(&id);
                    log::info!("node left: {id}");
                }
                Mail::Shutdown => {
                    self.stop_executor();
                    self.inner.server.shutdown();
                    log::info!("terminal shut down");
                    return;
                }
            }
        }
    }

    /// Ask a running `run()` to wind everything down.
    pub fn shutdown(&self) {
        let _ = self.inner.mail_tx.send(Mail::Shutdown);
    }

    fn handle_packet(&self, pkt: Packet) {
        let executor = {
            let slot = self.inner.exec.lock().unwrap();
            if !slot.executing {
                return;
            }
            slot.executor.clone()
        };
        if let Some(executor) = executor {
            log::debug!("forwarding {pkt}");
            executor.touche(u32::from(pkt.step), u32::from(pkt.id), pkt.delay_ms);
        }
    }

    fn load(&self, strategy: Strategy) -> Result<(), TerminalError> {
        let mut slot = self.inner.exec.lock().unwrap();
        if slot.executing {
            return Err(TerminalError::ExecutorRunning);
        }
        let executor = Executor::new(strategy);
        executor.start(Arc::new(PacketSender {
            server: self.inner.server.clone(),
        }))?;
        let events = executor.take_events();
        slot.executor = Some(executor.clone());
        slot.executing = true;
        drop(slot);
        if let Some(events) = events {
            let inner = self.inner.clone();
            thread::Builder::new()
                .name("exec-events".into())
                .spawn(move || drain_events(inner, executor, events))
                .expect("event drain thread spawn failed");
        }
        Ok(())
    }

    fn stop_executor(&self) {
        let executor = {
            let mut slot = self.inner.exec.lock().unwrap();
            if !slot.executing {
                None
            } else {
                slot.executing = false;
                slot.executor.take()
            }
        };
        if let Some(executor) = executor {
            if let Err(err) = executor.stop() {
                log::debug!("executor already finished: {err}");
            }
        }
    }
}

impl ble::Client for Terminal {
    type Error = TerminalError;

    fn write(&self, message: &[u8]) -> Result<(), TerminalError> {
        match comm::parse_command(message)? {
            TerminalCommand::Stop => {
                self.stop_executor();
                Ok(())
            }
            TerminalCommand::LoadCustom(cfg) => self.load(Strategy::Custom(cfg)),
            TerminalCommand::LoadRandom(cfg) => self.load(Strategy::Random(cfg)),
        }
    }
}

/// Pool listener that forwards everything into the terminal mailbox.
struct Mailbox {
    tx: SyncSender<Mail>,
}

impl Listener for Mailbox {
    fn receive(&self, packet: Packet) {
        let _ = self.tx.send(Mail::Packet(packet));
    }
    fn new_node(&self, id: u16) {
        let _ = self.tx.send(Mail::NodeUp(id));
    }
    fn lost_node(&self, id: u16) {
        let _ = self.tx.send(Mail::NodeDown(id));
    }
}

/// The executor's sending capability: node configs become Touche-typed
/// wire frames addressed through the pool.
struct PacketSender {
    server: Server,
}

impl Sender for PacketSender {
    fn send(&self, step_id: u32, config: &NodeConfig) {
        let packet = Packet {
            kind: PacketType::Touche,
            id: config.id as u16,
            color: config.color,
            delay_ms: config.delay_ms,
            step: step_id as u16,
            sound: false,
            distance: false,
        };
        if let Err(err) = self.server.send(packet) {
            log::warn!("failed to command node {}: {err}", config.id);
        }
    }
}

/// Pump one run's events to the notify queue, then close the run out
/// with its result transcript and release the executor slot.
fn drain_events(inner: Arc<Inner>, executor: Executor, events: Receiver<Event>) {
    let started = Instant::now();
    let mut transcript = Vec::new();
    for event in events {
        if let Some(bytes) = comm::serialize_message(&DeviceMessage::Event(&event)) {
            if inner.notify_tx.send(bytes).is_err() {
                log::debug!("notification queue closed");
            }
        }
        transcript.push(event);
    }
    let result = RoutineResult {
        steps: executor.steps_total(),
        duration_ms: started.elapsed().as_millis() as u32,
        events: transcript,
    };
    if let Some(bytes) = comm::serialize_message(&DeviceMessage::Result(&result)) {
        let _ = inner.notify_tx.send(bytes);
    }
    let mut slot = inner.exec.lock().unwrap();
    slot.executing = false;
    slot.executor = None;
    log::info!(
        "routine finished: {} steps in {} ms",
        result.steps,
        result.duration_ms
    );
}
