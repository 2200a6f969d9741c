//! Stream handle, send-backend capability, and the single-writer task.
//!
//! The original `struct stream` carries two function pointers (send raw
//! buffer; send packet object) to support a TCP-packet-handle backend
//! alongside a raw-socket backend. Per the §9 Design Note, this crate
//! replaces both with a small [`SendBackend`] enum and funnels every send
//! through one writer task per connection — the same single-writer-task
//! pattern the teacher uses to serialize frame writes onto its tunnel
//! socket (`tunnel::writer`), generalized here from `Frame` bytes to this
//! protocol's own packet bytes.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::packet::{serialize_packet, CodecError, Packet, SampleBytes};

static NEXT_STREAM_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Monotonic generation counter standing in for stream-pointer identity:
/// "a signal is subscribed iff its stream equals the active stream" becomes
/// a comparison against this id rather than a raw pointer comparison.
pub fn next_generation() -> u64 {
    NEXT_STREAM_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// An 8-hex-character stream ID from two 16-bit random draws, reproducing
/// `(rand()<<16)|rand()` concatenated twice in the original. Uppercase, per
/// the original's `snprintf(stream_id, sizeof(stream_id), "%08X", ...)` —
/// this value is wire-visible (echoed in `init` meta, used to namespace
/// JSON-RPC methods), so its case must match the original exactly.
pub fn generate_stream_id(rng: &mut impl RngCore) -> String {
    let hi = ((rng.next_u32() as u16 as u32) << 16) | rng.next_u32() as u16 as u32;
    format!("{:08X}", hi)
}

/// Which wire framing a connection's outbound packets use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBackend {
    WebSocket,
    RawTcp,
}

impl SendBackend {
    fn ws_enabled(self) -> bool {
        matches!(self, SendBackend::WebSocket)
    }
}

/// A live connection's identity plus a channel to its dedicated writer
/// task. Cheap to clone and share across the registry, the JSON-RPC
/// handler, and the RX filter.
#[derive(Clone)]
pub struct StreamHandle {
    id: u64,
    stream_id: std::sync::Arc<str>,
    backend: SendBackend,
    tx: mpsc::Sender<Bytes>,
}

impl StreamHandle {
    pub fn new(id: u64, stream_id: impl Into<std::sync::Arc<str>>, backend: SendBackend, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            stream_id: stream_id.into(),
            backend,
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn enqueue(&self, packet: &Packet<'_>) -> Result<(), CodecError> {
        let mut dst = BytesMut::new();
        serialize_packet(packet, &mut dst, self.backend.ws_enabled())?;
        if self.tx.try_send(dst.freeze()).is_err() {
            debug!(stream_id = %self.stream_id, "writer channel closed, dropping outbound packet");
        }
        Ok(())
    }

    pub fn send_meta(&self, signal_number: u32, payload: Bytes) -> Result<(), CodecError> {
        self.enqueue(&Packet::Meta {
            signal_number,
            payload,
        })
    }

    pub fn send_explicit(
        &self,
        signal_number: u32,
        sample_size: usize,
        samples: &[SampleBytes<'_>],
    ) -> Result<(), CodecError> {
        self.enqueue(&Packet::DataExplicit {
            signal_number,
            sample_size,
            samples,
        })
    }

    pub fn send_implicit(
        &self,
        signal_number: u32,
        value_index: u64,
        sample: SampleBytes<'_>,
    ) -> Result<(), CodecError> {
        self.enqueue(&Packet::DataImplicit {
            signal_number,
            value_index,
            sample,
        })
    }

    /// Send a pre-built raw frame (used by the WS RX filter to echo
    /// ping/pong/close replies, which bypass the TL packet codec entirely).
    pub fn send_raw(&self, bytes: BytesMut) {
        if self.tx.try_send(bytes.freeze()).is_err() {
            debug!(stream_id = %self.stream_id, "writer channel closed, dropping raw frame");
        }
    }
}

/// Spawn the dedicated writer task that serializes every outbound write
/// onto `socket`. Returns the sender side; the task exits (and the socket
/// is dropped) once every sender clone is dropped.
pub fn spawn_writer<W>(mut socket: W) -> (mpsc::Sender<Bytes>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(256);
    let handle = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        while let Some(bytes) = rx.recv().await {
            if let Err(e) = socket.write_all(&bytes).await {
                debug!(error = %e, "stream write failed, closing writer task");
                break;
            }
        }
    });
    (tx, handle)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn noop_stream_handle(id: u64) -> StreamHandle {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        StreamHandle::new(id, "deadbeef", SendBackend::RawTcp, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn stream_id_is_eight_uppercase_hex_chars() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let id = generate_stream_id(&mut rng);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }
}
