/// BLE GATT fragmenter — the byte transport between the companion app
/// and the terminal.
///
/// The write characteristic carries inbound messages as chunks of at
/// most 20 bytes: a flag byte (continue / end) followed by payload. The
/// fragmenter reassembles them and hands the complete message to its
/// `Client`, translating the outcome to a GATT status byte. Outbound
/// messages are chunked onto the notify characteristic with the same
/// framing and a fixed inter-chunk gap.
///
/// The concrete BLE stack stays behind the `GattHost` trait; this
/// module owns no business logic and no radio.

use std::sync::mpsc::Receiver;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::comm;

/// Chunk flag bytes.
pub const CONTINUE_FLAG: u8 = 0x00;
pub const END_FLAG: u8 = 0x01;

/// Payload bytes per notify chunk (MTU 20 minus the flag byte).
pub const NOTIFY_PAYLOAD: usize = 0x13;

/// Full chunk size: flag plus payload.
pub const CHUNK_SIZE: usize = NOTIFY_PAYLOAD + 1;

/// Gap between consecutive notify chunks.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// An upload that goes quiet for this long is considered aborted and
/// its partial buffer dropped.
pub const IDLE_RESET: Duration = Duration::from_millis(500);

/// GATT status bytes reported back to the central.
pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_UNEXPECTED_ERROR: u8 = 0x0E;

/// One outbound notification chunk.
pub type Chunk = heapless::Vec<u8, CHUNK_SIZE>;

/// Consumer of reassembled write payloads. Implemented by the terminal.
pub trait Client: Send + Sync + 'static {
    type Error: std::fmt::Display;

    fn write(&self, message: &[u8]) -> Result<(), Self::Error>;
}

/// Sink for notify chunks, produced by the GATT host when the service
/// is installed.
pub trait NotifySink: Send + 'static {
    fn notify(&mut self, chunk: &[u8]);
}

/// The two-characteristic service shape the fragmenter needs hosted.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSpec {
    pub service_uuid: u16,
    pub write_uuid: u16,
    pub notify_uuid: u16,
}

impl ServiceSpec {
    /// The terminal's service as advertised to companion apps.
    pub fn terminal() -> ServiceSpec {
        ServiceSpec {
            service_uuid: comm::SERVICE_UUID,
            write_uuid: comm::WRITE_UUID,
            notify_uuid: comm::NOTIFY_UUID,
        }
    }
}

/// Handler invoked for every chunk written to the write characteristic;
/// returns the GATT status byte.
pub type WriteHandler = Box<dyn Fn(&[u8]) -> u8 + Send + Sync>;

/// The named interface onto the platform BLE stack: install the service
/// with its two characteristics, then advertise it.
pub trait GattHost {
    type Sink: NotifySink;
    type Error: std::fmt::Display;

    fn install(&mut self, spec: ServiceSpec, on_write: WriteHandler)
        -> Result<Self::Sink, Self::Error>;

    fn advertise(&mut self, name: &str) -> Result<(), Self::Error>;
}

/// Reassembles chunked writes into whole messages.
pub struct Reassembler {
    buf: Vec<u8>,
    last_rx: Option<Instant>,
    idle_reset: Duration,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::with_idle_reset(IDLE_RESET)
    }

    pub fn with_idle_reset(idle_reset: Duration) -> Reassembler {
        Reassembler {
            buf: Vec::new(),
            last_rx: None,
            idle_reset,
        }
    }

    /// Feed one chunk. Returns the complete message when the chunk
    /// carries the end flag.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        let (&flag, payload) = chunk.split_first()?;
        let now = Instant::now();
        if let Some(last) = self.last_rx {
            // An aborted upload leaves a stale prefix behind; drop it
            // once the sender has gone quiet.
            if !self.buf.is_empty() && now.duration_since(last) > self.idle_reset {
                log::warn!("dropping {} stale reassembly bytes", self.buf.len());
                self.buf.clear();
            }
        }
        self.buf.extend_from_slice(payload);
        if flag == CONTINUE_FLAG {
            self.last_rx = Some(now);
            None
        } else {
            self.last_rx = None;
            Some(std::mem::take(&mut self.buf))
        }
    }
}

impl Default for Reassembler {
    fn default() -> Reassembler {
        Reassembler::new()
    }
}

/// Write-side glue: reassembly plus delivery to the client.
pub struct Fragmenter<C: Client> {
    client: C,
    reassembly: Mutex<Reassembler>,
}

impl<C: Client> Fragmenter<C> {
    pub fn new(client: C) -> Fragmenter<C> {
        Fragmenter {
            client,
            reassembly: Mutex::new(Reassembler::new()),
        }
    }

    /// Handle one chunk from the write characteristic and return the
    /// GATT status for it.
    pub fn handle_write(&self, chunk: &[u8]) -> u8 {
        let complete = self.reassembly.lock().unwrap().push(chunk);
        match complete {
            None => STATUS_SUCCESS,
            Some(message) => match self.client.write(&message) {
                Ok(()) => STATUS_SUCCESS,
                Err(err) => {
                    log::warn!("command rejected: {err}");
                    STATUS_UNEXPECTED_ERROR
                }
            },
        }
    }
}

/// Split a message into notify chunks. Every chunk is flag-prefixed;
/// only the last carries the end flag. A message whose length is a
/// multiple of the payload size ends with an empty end chunk.
pub fn chunks(message: &[u8]) -> impl Iterator<Item = Chunk> + '_ {
    let total = message.len() / NOTIFY_PAYLOAD + 1;
    (0..total).map(move |i| {
        let start = i * NOTIFY_PAYLOAD;
        let end = (start + NOTIFY_PAYLOAD).min(message.len());
        let mut chunk = Chunk::new();
        let flag = if i + 1 == total { END_FLAG } else { CONTINUE_FLAG };
        let _ = chunk.push(flag);
        let _ = chunk.extend_from_slice(&message[start..end]);
        chunk
    })
}

/// Drain the notification stream into the sink, one message at a time,
/// pacing chunks by `interval`. Returns when the stream closes.
pub fn run_notifier<S: NotifySink>(messages: Receiver<Vec<u8>>, mut sink: S, interval: Duration) {
    for message in messages {
        for chunk in chunks(&message) {
            sink.notify(&chunk);
            thread::sleep(interval);
        }
    }
}

/// Install the terminal service on the host, route writes into the
/// client, spawn the notify pump, and start advertising.
pub fn serve<H, C>(
    host: &mut H,
    client: C,
    notifications: Receiver<Vec<u8>>,
    name: &str,
) -> Result<(), H::Error>
where
    H: GattHost,
    C: Client,
{
    let fragmenter = Fragmenter::new(client);
    let sink = host.install(
        ServiceSpec::terminal(),
        Box::new(move |chunk| fragmenter.handle_write(chunk)),
    )?;
    thread::Builder::new()
        .name("ble-notify".into())
        .spawn(move || run_notifier(notifications, sink, CHUNK_INTERVAL))
        .expect("notify pump thread spawn failed");
    host.advertise(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;

    struct Accepting {
        received: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Client for Accepting {
        type Error = String;

        fn write(&self, message: &[u8]) -> Result<(), String> {
            self.received.lock().unwrap().push(message.to_vec());
            Ok(())
        }
    }

    struct Rejecting;

    impl Client for Rejecting {
        type Error = String;

        fn write(&self, _message: &[u8]) -> Result<(), String> {
            Err("nope".into())
        }
    }

    // ── reassembly tests ────────────────────────────────────────────

    #[test]
    fn two_chunks_deliver_concatenation_once() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let fragmenter = Fragmenter::new(Accepting {
            received: received.clone(),
        });
        assert_eq!(fragmenter.handle_write(&[CONTINUE_FLAG, 1, 2, 3]), STATUS_SUCCESS);
        assert!(received.lock().unwrap().is_empty());
        assert_eq!(fragmenter.handle_write(&[END_FLAG, 4, 5]), STATUS_SUCCESS);
        assert_eq!(*received.lock().unwrap(), vec![vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn rejected_message_reports_unexpected_error() {
        let fragmenter = Fragmenter::new(Rejecting);
        assert_eq!(fragmenter.handle_write(&[END_FLAG, 9]), STATUS_UNEXPECTED_ERROR);
    }

    #[test]
    fn single_end_chunk_delivers_alone() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let fragmenter = Fragmenter::new(Accepting {
            received: received.clone(),
        });
        assert_eq!(fragmenter.handle_write(&[END_FLAG, 7, 8]), STATUS_SUCCESS);
        assert_eq!(*received.lock().unwrap(), vec![vec![7, 8]]);
    }

    #[test]
    fn idle_reset_drops_stale_prefix() {
        let mut reassembler = Reassembler::with_idle_reset(Duration::from_millis(10));
        assert!(reassembler.push(&[CONTINUE_FLAG, 1, 2]).is_none());
        thread::sleep(Duration::from_millis(40));
        let message = reassembler.push(&[END_FLAG, 9]).unwrap();
        assert_eq!(message, vec![9]);
    }

    #[test]
    fn fast_chunks_are_not_reset() {
        let mut reassembler = Reassembler::with_idle_reset(Duration::from_millis(200));
        assert!(reassembler.push(&[CONTINUE_FLAG, 1]).is_none());
        assert!(reassembler.push(&[CONTINUE_FLAG, 2]).is_none());
        assert_eq!(reassembler.push(&[END_FLAG, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(&[]).is_none());
    }

    // ── chunking tests ──────────────────────────────────────────────

    #[test]
    fn forty_byte_message_chunks_into_three() {
        let message: Vec<u8> = (0..40).collect();
        let out: Vec<Chunk> = chunks(&message).collect();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0][0], CONTINUE_FLAG);
        assert_eq!(&out[0][1..], &message[..19]);
        assert_eq!(out[1][0], CONTINUE_FLAG);
        assert_eq!(&out[1][1..], &message[19..38]);
        assert_eq!(out[2][0], END_FLAG);
        assert_eq!(&out[2][1..], &message[38..]);
    }

    #[test]
    fn short_message_is_single_end_chunk() {
        let out: Vec<Chunk> = chunks(&[1, 2, 3]).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0][..], &[END_FLAG, 1, 2, 3]);
    }

    #[test]
    fn payload_multiple_ends_with_empty_chunk() {
        let message = vec![0u8; NOTIFY_PAYLOAD];
        let out: Vec<Chunk> = chunks(&message).collect();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].len(), 1);
        assert_eq!(out[1][0], END_FLAG);
    }

    // ── notifier tests ──────────────────────────────────────────────

    struct RecordingSink {
        chunks: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
    }

    impl NotifySink for RecordingSink {
        fn notify(&mut self, chunk: &[u8]) {
            self.chunks
                .lock()
                .unwrap()
                .push((Instant::now(), chunk.to_vec()));
        }
    }

    #[test]
    fn notifier_paces_chunks() {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            chunks: recorded.clone(),
        };
        let (tx, rx) = mpsc::sync_channel(2);
        tx.send((0u8..40).collect::<Vec<u8>>()).unwrap();
        drop(tx);
        run_notifier(rx, sink, Duration::from_millis(20));

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[0].1[0], CONTINUE_FLAG);
        assert_eq!(recorded[2].1[0], END_FLAG);
        for pair in recorded.windows(2) {
            assert!(pair[1].0.duration_since(pair[0].0) >= Duration::from_millis(20));
        }
    }

    #[test]
    fn production_pacing_is_hundred_millis() {
        assert_eq!(CHUNK_INTERVAL, Duration::from_millis(100));
        assert_eq!(NOTIFY_PAYLOAD, 19);
    }

    // ── serve tests ─────────────────────────────────────────────────

    struct FakeHost {
        write_handler: Arc<Mutex<Option<WriteHandler>>>,
        notified: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        advertised: Option<String>,
    }

    impl GattHost for FakeHost {
        type Sink = RecordingSink;
        type Error = String;

        fn install(
            &mut self,
            spec: ServiceSpec,
            on_write: WriteHandler,
        ) -> Result<RecordingSink, String> {
            assert_eq!(spec.service_uuid, crate::comm::SERVICE_UUID);
            *self.write_handler.lock().unwrap() = Some(on_write);
            Ok(RecordingSink {
                chunks: self.notified.clone(),
            })
        }

        fn advertise(&mut self, name: &str) -> Result<(), String> {
            self.advertised = Some(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn serve_wires_writes_and_notifications() {
        let write_handler = Arc::new(Mutex::new(None));
        let notified = Arc::new(Mutex::new(Vec::new()));
        let mut host = FakeHost {
            write_handler: write_handler.clone(),
            notified: notified.clone(),
            advertised: None,
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let (notify_tx, notify_rx) = mpsc::sync_channel(4);

        serve(
            &mut host,
            Accepting {
                received: received.clone(),
            },
            notify_rx,
            "terminal",
        )
        .unwrap();
        assert_eq!(host.advertised.as_deref(), Some("terminal"));

        // A chunked write reaches the client reassembled.
        let handler = write_handler.lock().unwrap();
        let handler = handler.as_ref().unwrap();
        assert_eq!(handler(&[CONTINUE_FLAG, 1, 2]), STATUS_SUCCESS);
        assert_eq!(handler(&[END_FLAG, 3]), STATUS_SUCCESS);
        assert_eq!(*received.lock().unwrap(), vec![vec![1, 2, 3]]);

        // A queued message goes out as notify chunks.
        notify_tx.send(vec![9; 5]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if !notified.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "notification never arrived");
            thread::sleep(Duration::from_millis(5));
        }
        let sent = notified.lock().unwrap();
        assert_eq!(sent[0].1, [&[END_FLAG][..], &[9; 5][..]].concat());
    }
}
