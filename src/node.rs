/// Per-node TCP connection — one reader and one writer worker.
///
/// The reader enforces the keep-alive deadline: every well-formed frame
/// is evidence of liveness and pushes the deadline out, keep-alive
/// frames are swallowed, and any read error or missed deadline tears the
/// connection down. The writer drains a bounded request queue of encoded
/// frames. Both workers report the node id on the lost path exactly once
/// and exit; a node is never revived — a reconnect builds a fresh one.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::Duration;

use crate::protocol::{Packet, PacketType, PACKET_SIZE};

/// Pending-write queue depth per node.
const REQUEST_QUEUE: usize = 32;

/// The connection surface the reader needs. `TcpStream` is the real
/// implementation; tests script their own.
pub(crate) trait FrameConn: Send + 'static {
    /// Block until a full frame arrives or the read deadline passes.
    fn read_frame(&mut self, buf: &mut [u8; PACKET_SIZE]) -> io::Result<()>;
    /// Push the read deadline out to now + `keep_alive`.
    fn refresh_deadline(&mut self, keep_alive: Duration) -> io::Result<()>;
}

impl FrameConn for TcpStream {
    fn read_frame(&mut self, buf: &mut [u8; PACKET_SIZE]) -> io::Result<()> {
        self.read_exact(buf)
    }

    fn refresh_deadline(&mut self, keep_alive: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(keep_alive))
    }
}

/// Sending side of a live node connection. Held in the server pool.
pub(crate) struct NodeHandle {
    id: u16,
    requests: SyncSender<Vec<u8>>,
    stream: TcpStream,
}

impl NodeHandle {
    /// A clone of the writer queue, for sends that must not hold the
    /// pool lock. Sending on it fails once the connection is torn down —
    /// never a silent drop.
    pub(crate) fn sender(&self) -> SyncSender<Vec<u8>> {
        self.requests.clone()
    }

    /// Tear the connection down. The reader observes the shutdown as a
    /// read error and reports the node lost.
    pub(crate) fn close(&self) {
        log::debug!("closing node {}", self.id);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Start the reader/writer pair for an established connection and hand
/// back the send/close surface.
pub(crate) fn listen<P, L>(
    stream: TcpStream,
    id: u16,
    keep_alive: Duration,
    on_packet: P,
    on_lost: L,
) -> io::Result<NodeHandle>
where
    P: FnMut(Packet) + Send + 'static,
    L: Fn(u16) + Send + Clone + 'static,
{
    let reader = stream.try_clone()?;
    let writer = stream.try_clone()?;
    let (requests, queue) = mpsc::sync_channel(REQUEST_QUEUE);
    let writer_lost = on_lost.clone();
    thread::Builder::new()
        .name(format!("node-{id}-read"))
        .spawn(move || run_reader(reader, id, keep_alive, on_packet, on_lost))?;
    thread::Builder::new()
        .name(format!("node-{id}-write"))
        .spawn(move || run_writer(writer, id, queue, writer_lost))?;
    Ok(NodeHandle {
        id,
        requests,
        stream,
    })
}

fn run_reader<C, P, L>(mut conn: C, id: u16, keep_alive: Duration, mut on_packet: P, on_lost: L)
where
    C: FrameConn,
    P: FnMut(Packet),
    L: Fn(u16),
{
    if let Err(err) = conn.refresh_deadline(keep_alive) {
        log::warn!("node {id}: failed to arm read deadline: {err}");
        on_lost(id);
        return;
    }
    let mut buf = [0u8; PACKET_SIZE];
    loop {
        if conn.read_frame(&mut buf).is_err() {
            on_lost(id);
            return;
        }
        let pkt = match Packet::decode(&buf) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::warn!("node {id}: dropping frame: {err}");
                continue;
            }
        };
        // Any well-formed frame counts as liveness.
        if conn.refresh_deadline(keep_alive).is_err() {
            on_lost(id);
            return;
        }
        if pkt.kind == PacketType::KeepAlive {
            log::debug!("keep alive node: {id}");
            continue;
        }
        on_packet(pkt);
    }
}

fn run_writer<W, L>(mut conn: W, id: u16, queue: Receiver<Vec<u8>>, on_lost: L)
where
    W: Write,
    L: Fn(u16),
{
    for frame in queue {
        if let Err(err) = conn.write_all(&frame) {
            log::warn!("node {id}: write failed: {err}");
            on_lost(id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Color;
    use std::collections::VecDeque;
    use std::sync::mpsc::TryRecvError;

    /// Scripted connection: plays back a fixed sequence of read results
    /// and counts deadline refreshes.
    struct Script {
        reads: VecDeque<Result<[u8; PACKET_SIZE], io::ErrorKind>>,
        refreshes: SyncSender<()>,
    }

    impl FrameConn for Script {
        fn read_frame(&mut self, buf: &mut [u8; PACKET_SIZE]) -> io::Result<()> {
            match self.reads.pop_front() {
                Some(Ok(frame)) => {
                    *buf = frame;
                    Ok(())
                }
                Some(Err(kind)) => Err(kind.into()),
                None => Err(io::ErrorKind::TimedOut.into()),
            }
        }

        fn refresh_deadline(&mut self, _keep_alive: Duration) -> io::Result<()> {
            let _ = self.refreshes.send(());
            Ok(())
        }
    }

    fn frame(kind: PacketType, id: u16) -> [u8; PACKET_SIZE] {
        Packet {
            kind,
            id,
            color: Color::None,
            delay_ms: 0,
            step: 1,
            sound: false,
            distance: false,
        }
        .encode()
    }

    #[test]
    fn reader_emits_packet_then_lost() {
        let (refresh_tx, _refresh_rx) = mpsc::sync_channel(16);
        let conn = Script {
            reads: VecDeque::from([
                Ok(frame(PacketType::Touche, 18)),
                Err(io::ErrorKind::ConnectionReset),
            ]),
            refreshes: refresh_tx,
        };
        let (packets_tx, packets_rx) = mpsc::sync_channel(16);
        let (lost_tx, lost_rx) = mpsc::sync_channel(16);
        run_reader(
            conn,
            18,
            Duration::from_secs(5),
            move |pkt| packets_tx.send(pkt).unwrap(),
            move |id| lost_tx.send(id).unwrap(),
        );
        let pkt = packets_rx.try_recv().unwrap();
        assert_eq!(pkt.id, 18);
        assert_eq!(pkt.kind, PacketType::Touche);
        assert_eq!(packets_rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(lost_rx.try_recv(), Ok(18));
        assert_eq!(lost_rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn reader_swallows_keep_alive_and_refreshes_deadline() {
        let (refresh_tx, refresh_rx) = mpsc::sync_channel(16);
        let conn = Script {
            reads: VecDeque::from([
                Ok(frame(PacketType::KeepAlive, 4)),
                Err(io::ErrorKind::TimedOut),
            ]),
            refreshes: refresh_tx,
        };
        let (packets_tx, packets_rx) = mpsc::sync_channel(16);
        let (lost_tx, lost_rx) = mpsc::sync_channel(16);
        run_reader(
            conn,
            4,
            Duration::from_secs(5),
            move |pkt| packets_tx.send(pkt).unwrap(),
            move |id| lost_tx.send(id).unwrap(),
        );
        // No packet surfaced, but the deadline was refreshed twice:
        // once on start, once for the keep-alive frame.
        assert_eq!(packets_rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(refresh_rx.try_iter().count(), 2);
        assert_eq!(lost_rx.try_recv(), Ok(4));
    }

    #[test]
    fn reader_skips_undecodable_frames() {
        let (refresh_tx, _refresh_rx) = mpsc::sync_channel(16);
        let conn = Script {
            reads: VecDeque::from([
                Ok([0u8; PACKET_SIZE]),
                Ok(frame(PacketType::Touche, 2)),
                Err(io::ErrorKind::ConnectionReset),
            ]),
            refreshes: refresh_tx,
        };
        let (packets_tx, packets_rx) = mpsc::sync_channel(16);
        let (lost_tx, _lost_rx) = mpsc::sync_channel(16);
        run_reader(
            conn,
            2,
            Duration::from_secs(5),
            move |pkt| packets_tx.send(pkt).unwrap(),
            move |id| lost_tx.send(id).unwrap(),
        );
        assert_eq!(packets_rx.try_iter().count(), 1);
    }

    #[test]
    fn writer_reports_lost_on_write_error() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(vec![1, 2, 3]).unwrap();
        drop(tx);
        let (lost_tx, lost_rx) = mpsc::sync_channel(4);
        run_writer(FailingWriter, 7, rx, move |id| lost_tx.send(id).unwrap());
        assert_eq!(lost_rx.try_recv(), Ok(7));
    }

    #[test]
    fn writer_exits_cleanly_when_queue_closes() {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(4);
        drop(tx);
        let (lost_tx, lost_rx) = mpsc::sync_channel::<u16>(4);
        run_writer(Vec::new(), 7, rx, move |id| lost_tx.send(id).unwrap());
        assert_eq!(lost_rx.try_recv(), Err(TryRecvError::Disconnected));
    }
}
