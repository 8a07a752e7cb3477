//! Non-blocking, fork-safe serialized write queue.
//!
//! Watchers publish data from inside their poll loop and must never stall
//! on a slow or full transport. [`SerializedWriteQueue`] wraps a bounded
//! OS pipe: `put` serializes in the caller (fixing the item's value and
//! per-process order at call time) and hands the frame to a single
//! background writer thread that performs the blocking write.
//!
//! The writer thread is keyed by the pid that owns it. After a fork the
//! child inherits the queue but not the parent's threads, so the first
//! `put` in a new process atomically rebuilds the writer before
//! dispatching. Frames queued in the dead writer's channel at fork time
//! are lost in the child, matching the best-effort contract.
//!
//! Failed writes are logged and dropped; nothing propagates to the
//! caller. Only serialization and worker-spawn failures surface, since
//! those are caller-side conditions.

use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::mpsc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, WatcherError};

// =============================================================================
// PipeTransport
// =============================================================================

/// Length-prefixed frames over an OS pipe.
///
/// The pipe is the cross-process boundary: both descriptors are inherited
/// by a forked child, and the kernel buffer bounds the queue. Writes of a
/// whole small frame are atomic (PIPE_BUF); larger frames rely on the
/// single-writer-per-process discipline upheld by the worker.
struct PipeTransport {
    read: OwnedFd,
    write: OwnedFd,
}

impl PipeTransport {
    fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().map_err(WatcherError::os)?;
        Ok(Self { read, write })
    }

    fn send_frame(&self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| WatcherError::serialization("frame exceeds u32 length"))?;
        if payload.len() + 4 > libc::PIPE_BUF {
            // Above PIPE_BUF the kernel no longer guarantees the write is
            // atomic; correctness then rests on one writer thread per
            // process, which concurrent post-fork writers break.
            tracing::debug!(
                len = payload.len(),
                "frame exceeds PIPE_BUF; atomicity rests on single-writer discipline"
            );
        }
        self.write_all(&len.to_le_bytes())?;
        self.write_all(payload)
    }

    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match nix::unistd::write(self.write.as_fd(), buf) {
                Ok(0) => return Err(WatcherError::Closed),
                Ok(n) => buf = &buf[n..],
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::EPIPE) => return Err(WatcherError::Closed),
                Err(err) => return Err(WatcherError::os(err)),
            }
        }
        Ok(())
    }

    fn recv_frame(&self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn read_exact(&self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            match nix::unistd::read(self.read.as_raw_fd(), buf) {
                Ok(0) => return Err(WatcherError::Closed),
                Ok(n) => buf = &mut buf[n..],
                Err(nix::errno::Errno::EINTR) => {}
                Err(err) => return Err(WatcherError::os(err)),
            }
        }
        Ok(())
    }

    /// Non-blocking readability check on the read end.
    fn readable(&self) -> bool {
        use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

        let mut fds = [PollFd::new(self.read.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) | Err(_) => false,
            Ok(_) => fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN)),
        }
    }
}

// =============================================================================
// WriterWorker
// =============================================================================

/// The single background writer of one process.
struct WriterWorker {
    /// Pid that owns this worker's thread.
    pid: u32,
    tx: mpsc::Sender<Vec<u8>>,
}

impl WriterWorker {
    fn spawn(pid: u32, transport: Arc<PipeTransport>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        std::thread::Builder::new()
            .name("vigil-queue-writer".to_string())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    if let Err(err) = transport.send_frame(&frame) {
                        // Best-effort: the frame is dropped, the worker
                        // keeps serving later puts.
                        tracing::warn!(error = %err, "queue write failed; frame dropped");
                    }
                }
            })
            .map_err(|e| WatcherError::spawn(format!("queue writer thread: {e}")))?;
        tracing::debug!(pid, "queue writer started");
        Ok(Self { pid, tx })
    }
}

// =============================================================================
// SerializedWriteQueue
// =============================================================================

struct QueueCore {
    transport: Arc<PipeTransport>,
    worker: Mutex<Option<WriterWorker>>,
}

/// Single-producer-safe, non-blocking enqueue over a cross-process pipe.
///
/// Clones share the transport and the per-process writer. `put` never
/// blocks on the transport; `get` blocks until a frame arrives.
pub struct SerializedWriteQueue<T> {
    core: Arc<QueueCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for SerializedWriteQueue<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T> SerializedWriteQueue<T> {
    /// Creates a new queue over a fresh pipe.
    ///
    /// # Errors
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            core: Arc::new(QueueCore {
                transport: Arc::new(PipeTransport::new()?),
                worker: Mutex::new(None),
            }),
            _marker: PhantomData,
        })
    }

    /// Returns true if no frame is currently waiting to be read.
    #[must_use]
    pub fn empty(&self) -> bool {
        !self.core.transport.readable()
    }

    #[cfg(test)]
    fn force_worker_pid(&self, pid: u32) {
        if let Some(worker) = self.core.worker.lock().as_mut() {
            worker.pid = pid;
        }
    }
}

impl<T: Serialize> SerializedWriteQueue<T> {
    /// Enqueues an item without blocking on the transport.
    ///
    /// The item is serialized here, then handed to the background writer;
    /// on return the write has been handed off, not necessarily
    /// completed. If the calling process is not the one that owns the
    /// current writer (first use, or first use after a fork), the writer
    /// is rebuilt under the queue lock before dispatching.
    ///
    /// Frames at or below the platform's `PIPE_BUF` (4096 bytes on Linux)
    /// are written atomically by the kernel. Larger frames rely on the
    /// one-writer-thread-per-process discipline this queue maintains;
    /// they remain intact when only one process puts at a time, but a
    /// parent and a forked child putting oversized frames concurrently
    /// can interleave and desynchronize the stream.
    ///
    /// # Errors
    /// Returns an error if the item cannot be serialized or a writer
    /// thread cannot be spawned. Transport failures never surface.
    pub fn put(&self, item: &T) -> Result<()> {
        let frame =
            serde_json::to_vec(item).map_err(|e| WatcherError::serialization(e.to_string()))?;

        let pid = std::process::id();
        let mut worker = self.core.worker.lock();
        if worker.as_ref().is_none_or(|w| w.pid != pid) {
            *worker = Some(WriterWorker::spawn(pid, Arc::clone(&self.core.transport))?);
        }

        if let Some(w) = worker.as_ref() {
            if let Err(mpsc::SendError(frame)) = w.tx.send(frame) {
                // The writer thread died out from under us; rebuild once
                // and retry the same frame.
                tracing::warn!(pid, "queue writer gone; rebuilding");
                let rebuilt = WriterWorker::spawn(pid, Arc::clone(&self.core.transport))?;
                if rebuilt.tx.send(frame).is_err() {
                    tracing::warn!(pid, "queue writer unavailable; frame dropped");
                }
                *worker = Some(rebuilt);
            }
        }
        Ok(())
    }
}

impl<T: DeserializeOwned> SerializedWriteQueue<T> {
    /// Blocks until the next item is available and returns it.
    ///
    /// # Errors
    /// Returns [`WatcherError::Closed`] if the transport is closed, or a
    /// serialization error for a corrupt frame.
    pub fn get(&self) -> Result<T> {
        let payload = self.core.transport.recv_frame()?;
        serde_json::from_slice(&payload).map_err(|e| WatcherError::serialization(e.to_string()))
    }
}

impl<T> std::fmt::Debug for SerializedWriteQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pid = self.core.worker.lock().as_ref().map(|w| w.pid);
        f.debug_struct("SerializedWriteQueue")
            .field("worker_pid", &pid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn drain_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn wait_nonempty<T>(q: &SerializedWriteQueue<T>) {
        let deadline = drain_deadline();
        while q.empty() {
            assert!(Instant::now() < deadline, "queue never became readable");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let q: SerializedWriteQueue<Vec<u32>> = SerializedWriteQueue::new().unwrap();
        assert!(q.empty());
        q.put(&vec![1, 2, 3]).unwrap();
        assert_eq!(q.get().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_reflects_pending_frame() {
        let q: SerializedWriteQueue<String> = SerializedWriteQueue::new().unwrap();
        assert!(q.empty());
        q.put(&"ping".to_string()).unwrap();
        wait_nonempty(&q);
        let _ = q.get().unwrap();
        assert!(q.empty());
    }

    #[test]
    fn test_put_preserves_single_process_order() {
        let q: SerializedWriteQueue<u64> = SerializedWriteQueue::new().unwrap();
        for i in 0..50u64 {
            q.put(&i).unwrap();
        }
        for i in 0..50u64 {
            assert_eq!(q.get().unwrap(), i);
        }
    }

    #[test]
    fn test_stale_worker_pid_rebinds_transparently() {
        let q: SerializedWriteQueue<String> = SerializedWriteQueue::new().unwrap();
        q.put(&"before".to_string()).unwrap();
        assert_eq!(q.get().unwrap(), "before");

        // Pretend the current worker belongs to some pre-fork process:
        // the next put must rebuild the worker and still deliver.
        q.force_worker_pid(1);
        q.put(&"after".to_string()).unwrap();
        assert_eq!(q.get().unwrap(), "after");
    }

    #[test]
    fn test_clone_shares_transport() {
        let q: SerializedWriteQueue<u32> = SerializedWriteQueue::new().unwrap();
        let q2 = q.clone();
        q.put(&7).unwrap();
        assert_eq!(q2.get().unwrap(), 7);
    }

    #[test]
    fn test_put_does_not_block_on_full_pipe() {
        // Far more data than a pipe buffer holds; put must return
        // immediately while the writer thread absorbs the backpressure.
        let q: SerializedWriteQueue<String> = SerializedWriteQueue::new().unwrap();
        let blob = "x".repeat(16 * 1024);
        let started = Instant::now();
        for _ in 0..32 {
            q.put(&blob).unwrap();
        }
        assert!(started.elapsed() < Duration::from_secs(1), "put blocked");
        for _ in 0..32 {
            assert_eq!(q.get().unwrap().len(), blob.len());
        }
    }
}
