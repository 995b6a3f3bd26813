//! The framed control channel between the supervisor and the worker.
//!
//! Two raw OS pipes form one bidirectional channel. Every message is a
//! length-prefixed frame: an 8-byte little-endian payload length, then the
//! bincode-serialized [`Packet`]. The channel is built in the supervisor,
//! inherited across the spawn, and *activated* on each side afterwards;
//! activation closes the opposite side's descriptors and starts a reader
//! thread.

use crate::error::{Error, Result};
use crate::ipc::{self, Handle};
use crate::signal::{ControlNotifier, CTL_WORKER_COMMAND};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// A message on the control pipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// First supervisor→worker message: the inherited handle for the real
    /// stdin.
    Stdin(u64),
    /// Worker→supervisor: start watching these files.
    WatchFiles(Vec<PathBuf>),
    /// Worker→supervisor: restart me.
    Reload,
}

/// Packets awaiting the supervisor; `None` is the pipe-EOF sentinel.
pub type PacketQueue = Arc<Mutex<VecDeque<Option<Packet>>>>;

pub fn new_packet_queue() -> PacketQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

const FRAME_HEADER: usize = 8;
// an oversized length means a desynced or corrupted stream
const MAX_FRAME: u64 = 16 * 1024 * 1024;

fn write_frame(h: Handle, lock: &Mutex<()>, packet: &Packet) -> Result<()> {
    let payload = bincode::serialize(packet)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    frame.extend_from_slice(&payload);

    let _guard = lock.lock()?;
    ipc::write_all(h, &frame)?;
    Ok(())
}

/// `Ok(None)` is a clean EOF at a frame boundary. A truncated frame or a
/// read error comes back as `Err`; readers treat it exactly like EOF, so a
/// worker killed mid-send looks the same as one that closed its pipe.
fn read_frame(h: Handle) -> Result<Option<Packet>> {
    let mut header = [0u8; FRAME_HEADER];
    if !read_exact_or_eof(h, &mut header)? {
        return Ok(None);
    }
    let len = u64::from_le_bytes(header);
    if len > MAX_FRAME {
        return Err(Error::Pipe(format!("oversized frame ({} bytes)", len)));
    }
    let mut payload = vec![0u8; len as usize];
    if !read_exact_or_eof(h, &mut payload)? {
        return Err(Error::Pipe("truncated frame".to_string()));
    }
    Ok(Some(bincode::deserialize(&payload)?))
}

fn read_exact_or_eof(h: Handle, buf: &mut [u8]) -> Result<bool> {
    let mut off = 0;
    while off < buf.len() {
        let n = ipc::read(h, &mut buf[off..])?;
        if n == 0 {
            if off == 0 {
                return Ok(false);
            }
            return Err(Error::Pipe("short read on control pipe".to_string()));
        }
        off += n;
    }
    Ok(true)
}

/// One side of the channel.
pub struct ControlPipe {
    read: Handle,
    write: Handle,
    peer: Option<(Handle, Handle)>,
    write_lock: Mutex<()>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl ControlPipe {
    /// Build the supervisor's end. All four descriptors are inheritable; the
    /// worker's pair travels to it via [`ControlPipe::child_env`].
    pub fn pair() -> Result<ControlPipe> {
        let (c2p_read, c2p_write) = ipc::pipe()?;
        let (p2c_read, p2c_write) = ipc::pipe()?;
        for &h in &[c2p_read, c2p_write, p2c_read, p2c_write] {
            ipc::set_inheritable(h)?;
        }
        Ok(ControlPipe {
            read: c2p_read,
            write: p2c_write,
            peer: Some((p2c_read, c2p_write)),
            write_lock: Mutex::new(()),
            reader: None,
            closed: false,
        })
    }

    /// Encoding handed to the worker: its own (read, write) pair first, then
    /// ours so it can close them after the spawn.
    pub fn child_env(&self) -> String {
        let (peer_read, peer_write) = self.peer.expect("child_env before activation");
        format!(
            "{},{},{},{}",
            peer_read as u64, peer_write as u64, self.read as u64, self.write as u64
        )
    }

    /// Decode the worker's end from the spawn environment.
    pub fn from_child_env(s: &str) -> Result<ControlPipe> {
        let mut handles = [0u64; 4];
        let mut parts = s.split(',');
        for slot in handles.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::Pipe(format!("malformed pipe description: {:?}", s)))?;
            *slot = part
                .parse()
                .map_err(|_| Error::Pipe(format!("malformed pipe description: {:?}", s)))?;
        }
        Ok(ControlPipe {
            read: handles[0] as Handle,
            write: handles[1] as Handle,
            peer: Some((handles[2] as Handle, handles[3] as Handle)),
            write_lock: Mutex::new(()),
            reader: None,
            closed: false,
        })
    }

    /// Supervisor-side activation: drop the worker's descriptors and start
    /// pumping incoming packets onto the queue. Each packet is announced
    /// with a `WORKER_COMMAND` byte on the self-pipe; EOF enqueues the
    /// `None` sentinel, which is how a dying worker becomes a supervisor
    /// event.
    pub fn activate_parent(&mut self, queue: &PacketQueue, notifier: ControlNotifier) -> Result<()> {
        if let Some((peer_read, peer_write)) = self.peer.take() {
            ipc::close_quiet(peer_read);
            ipc::close_quiet(peer_write);
        }
        let read = self.read;
        let queue = Arc::clone(queue);
        self.reader = Some(
            thread::Builder::new()
                .name("reloadex-pipe".to_string())
                .spawn(move || parent_reader(read, queue, notifier))?,
        );
        Ok(())
    }

    /// Worker-side activation: drop the supervisor's descriptors, install
    /// the handed-over stdin, and start the watchdog reader that interrupts
    /// this process when the supervisor goes away.
    pub fn activate_child(&mut self) -> Result<()> {
        if let Some((peer_read, peer_write)) = self.peer.take() {
            ipc::close_quiet(peer_read);
            ipc::close_quiet(peer_write);
        }

        match read_frame(self.read) {
            Ok(Some(Packet::Stdin(h))) => ipc::patch_stdin(h as Handle)?,
            Ok(Some(other)) => debug!("expected the stdin handoff, got {:?}", other),
            Ok(None) | Err(_) => {
                return Err(Error::Pipe(
                    "supervisor went away during worker startup".to_string(),
                ))
            }
        }

        // keep our descriptors out of any grandchildren the worker spawns;
        // an inherited write end would mask the worker's death
        let _ = ipc::set_cloexec(self.read);
        let _ = ipc::set_cloexec(self.write);

        let read = self.read;
        self.reader = Some(
            thread::Builder::new()
                .name("reloadex-watchdog".to_string())
                .spawn(move || child_reader(read))?,
        );
        Ok(())
    }

    pub fn send(&self, packet: &Packet) -> Result<()> {
        write_frame(self.write, &self.write_lock, packet)
    }

    /// Tear down the supervisor's end after the worker is gone. The reader
    /// thread is joined first so its EOF sentinel cannot land in a later
    /// generation's queue.
    pub fn close(&mut self) {
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if !self.closed {
            self.closed = true;
            ipc::close_quiet(self.read);
            ipc::close_quiet(self.write);
            if let Some((peer_read, peer_write)) = self.peer.take() {
                ipc::close_quiet(peer_read);
                ipc::close_quiet(peer_write);
            }
        }
    }
}

impl Drop for ControlPipe {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            ipc::close_quiet(self.read);
            ipc::close_quiet(self.write);
            if let Some((peer_read, peer_write)) = self.peer.take() {
                ipc::close_quiet(peer_read);
                ipc::close_quiet(peer_write);
            }
        }
    }
}

fn parent_reader(read: Handle, queue: PacketQueue, notifier: ControlNotifier) {
    loop {
        match read_frame(read) {
            Ok(Some(packet)) => {
                match queue.lock() {
                    Ok(mut q) => q.push_back(Some(packet)),
                    Err(_) => break,
                }
                notifier.notify(CTL_WORKER_COMMAND);
            }
            Ok(None) => break,
            Err(err) => {
                debug!("control pipe read failed: {}", err);
                break;
            }
        }
    }
    if let Ok(mut q) = queue.lock() {
        q.push_back(None);
    }
    notifier.notify(CTL_WORKER_COMMAND);
}

fn child_reader(read: Handle) {
    loop {
        match read_frame(read) {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    debug!("lost the supervisor, shutting down");
    ipc::interrupt_self();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::ControlChannel;

    #[test]
    fn packet_survives_serialization() {
        let packets = vec![
            Packet::Stdin(7),
            Packet::WatchFiles(vec![PathBuf::from("/srv/app/config.ini")]),
            Packet::Reload,
        ];
        for packet in packets {
            let bytes = bincode::serialize(&packet).unwrap();
            let back: Packet = bincode::deserialize(&bytes).unwrap();
            assert_eq!(packet, back);
        }
    }

    #[test]
    fn frame_round_trip() {
        let (r, w) = ipc::pipe().unwrap();
        let lock = Mutex::new(());
        let packet = Packet::WatchFiles(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        write_frame(w, &lock, &packet).unwrap();
        assert_eq!(read_frame(r).unwrap(), Some(packet));
        ipc::close_quiet(r);
        ipc::close_quiet(w);
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let (r, w) = ipc::pipe().unwrap();
        ipc::close_quiet(w);
        assert_eq!(read_frame(r).unwrap(), None);
        ipc::close_quiet(r);
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let (r, w) = ipc::pipe().unwrap();
        // header promises ten bytes, only three arrive
        let mut frame = (10u64).to_le_bytes().to_vec();
        frame.extend_from_slice(b"abc");
        ipc::write_all(w, &frame).unwrap();
        ipc::close_quiet(w);
        assert!(read_frame(r).is_err());
        ipc::close_quiet(r);
    }

    #[test]
    fn reader_enqueues_packets_then_sentinel() {
        let (r, w) = ipc::pipe().unwrap();
        let chan = ControlChannel::new().unwrap();
        let queue = new_packet_queue();
        let lock = Mutex::new(());

        write_frame(w, &lock, &Packet::Reload).unwrap();
        ipc::close_quiet(w);

        let reader = {
            let queue = Arc::clone(&queue);
            let notifier = chan.notifier();
            thread::spawn(move || parent_reader(r, queue, notifier))
        };
        reader.join().unwrap();

        let mut q = queue.lock().unwrap();
        assert_eq!(q.pop_front(), Some(Some(Packet::Reload)));
        assert_eq!(q.pop_front(), Some(None));
        assert_eq!(chan.wait().unwrap(), Some(CTL_WORKER_COMMAND));
        assert_eq!(chan.wait().unwrap(), Some(CTL_WORKER_COMMAND));
        ipc::close_quiet(r);
    }
}
