//! Async Output Pump
//!
//! Drains an [`EncodeSession`] on a blocking tokio task and forwards each
//! encoded frame as an owned [`EncodedPacket`] over a bounded channel. The
//! arena space is returned as soon as the bytes are copied out, so a slow
//! receiver applies backpressure through the channel rather than by
//! holding encoder outputs.
//!
//! The pump stops when [`OutputPump::stop`] is called, when the receiver
//! is dropped, or when the session is deallocated.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lamco_codec::config::CodecConfig;
//! use lamco_codec::encoder::EncodeSession;
//! use lamco_codec::pump::{OutputPump, PumpConfig};
//! use lamco_codec::sim::SimulatedSession;
//! use lamco_surface::SystemAllocator;
//!
//! # async fn example() -> lamco_codec::Result<()> {
//! let config = CodecConfig::builder().resolution(64, 64).output_size_max(8192).build();
//! let session = Arc::new(EncodeSession::allocate(
//!     config,
//!     Box::new(SimulatedSession::new()),
//!     Box::new(SystemAllocator::new()),
//! )?);
//!
//! let mut pump = OutputPump::spawn(Arc::clone(&session), PumpConfig::default());
//! if let Some(input) = session.dequeue_input_buffer()? {
//!     input.write_luma(&[0x80; 64]);
//!     session.queue_input_buffer(input)?;
//! }
//! if let Some(packet) = pump.recv().await {
//!     println!("frame {} at QP {}: {} bytes", packet.index, packet.qp, packet.data.len());
//! }
//! pump.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::encoder::EncodeSession;
use crate::error::{CodecError, ErrorKind, Result};

/// Owned copy of one encoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    /// Input frame index
    pub index: u64,
    /// Quantizer the frame was encoded with
    pub qp: u8,
    /// Bitstream bytes
    pub data: Vec<u8>,
}

/// Output pump settings
#[derive(Debug, Clone, Copy)]
pub struct PumpConfig {
    /// Channel capacity in packets
    pub capacity: usize,
    /// Sync timeout per attempt, and idle sleep when nothing is queued
    pub poll: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            poll: Duration::from_millis(5),
        }
    }
}

/// Handle to a running output pump
pub struct OutputPump {
    receiver: mpsc::Receiver<EncodedPacket>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<u64>>,
}

impl OutputPump {
    /// Start pumping `session` on a blocking task
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(session: Arc<EncodeSession>, config: PumpConfig) -> Self {
        info!("Starting output pump with config: {:?}", config);
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let handle = {
            let shutdown = Arc::clone(&shutdown);
            tokio::task::spawn_blocking(move || pump(&session, &sender, &shutdown, config.poll))
        };

        Self {
            receiver,
            shutdown,
            handle,
        }
    }

    /// Next packet, or `None` once the pump has stopped
    pub async fn recv(&mut self) -> Option<EncodedPacket> {
        self.receiver.recv().await
    }

    /// Whether the pump task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the pump and return the number of packets it sent
    pub async fn stop(self) -> Result<u64> {
        let Self {
            receiver,
            shutdown,
            handle,
        } = self;
        shutdown.store(true, Ordering::Release);
        drop(receiver);

        let sent = handle.await.map_err(|e| CodecError::Pump(e.to_string()))??;
        debug!("Output pump stopped after {} packets", sent);
        Ok(sent)
    }
}

fn pump(
    session: &EncodeSession,
    sender: &mpsc::Sender<EncodedPacket>,
    shutdown: &AtomicBool,
    poll: Duration,
) -> Result<u64> {
    let mut sent = 0u64;

    while !shutdown.load(Ordering::Acquire) {
        if sender.is_closed() {
            debug!("Output pump receiver dropped");
            break;
        }

        let frame = match session.dequeue_output_buffer(Some(poll)) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                thread::sleep(poll);
                continue;
            }
            Err(CodecError::NotInitialized(_)) => {
                debug!("Session closed, output pump exiting");
                break;
            }
            Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::Backpressure) => {
                warn!("Output pump skipped a frame: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let copied = session.output_bytes(&frame);
        let (index, qp) = (frame.frame_index(), frame.qp());
        session.release_output_buffer(frame);
        let data = copied?;

        if data.is_empty() {
            continue;
        }
        trace!("Pumping frame {} ({} bytes)", index, data.len());
        if sender.blocking_send(EncodedPacket { index, qp, data }).is_err() {
            debug!("Output pump receiver dropped");
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::sim::SimulatedSession;
    use lamco_surface::SystemAllocator;
    use tokio::time::{sleep, timeout};

    fn session() -> Arc<EncodeSession> {
        let config = CodecConfig::builder()
            .resolution(64, 64)
            .async_depth(3)
            .output_size_max(4096)
            .build();
        Arc::new(
            EncodeSession::allocate(config, Box::new(SimulatedSession::new()), Box::new(SystemAllocator::new()))
                .expect("session"),
        )
    }

    async fn push(session: &EncodeSession, fill: u8) {
        loop {
            if let Some(input) = session.dequeue_input_buffer().expect("dequeue") {
                input.write_luma(&[fill; 64]);
                if session.queue_input_buffer(input).expect("queue") {
                    return;
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_packets_in_order() {
        let session = session();
        let mut pump = OutputPump::spawn(Arc::clone(&session), PumpConfig::default());

        for i in 0..5 {
            push(&session, i).await;
        }

        let mut indices = Vec::new();
        while indices.len() < 5 {
            let packet = timeout(Duration::from_secs(5), pump.recv())
                .await
                .expect("packet in time")
                .expect("pump running");
            assert!(!packet.data.is_empty());
            indices.push(packet.index);
        }
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);

        assert_eq!(pump.stop().await.expect("stop"), 5);
        assert_eq!(session.stats().frames_encoded, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_when_idle() {
        let session = session();
        let pump = OutputPump::spawn(Arc::clone(&session), PumpConfig::default());
        sleep(Duration::from_millis(20)).await;
        assert!(!pump.is_finished());
        assert_eq!(pump.stop().await.expect("stop"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deallocate_ends_pump() {
        let session = session();
        let mut pump = OutputPump::spawn(Arc::clone(&session), PumpConfig::default());

        session.deallocate().expect("deallocate");
        let next = timeout(Duration::from_secs(5), pump.recv()).await.expect("pump exits");
        assert!(next.is_none());
        assert!(pump.stop().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_channel_holds_no_arena_space() {
        let session = session();
        let config = PumpConfig {
            capacity: 1,
            poll: Duration::from_millis(1),
        };
        let mut pump = OutputPump::spawn(Arc::clone(&session), config);

        for i in 0..3 {
            push(&session, i).await;
        }
        // Capacity 1: the pump blocks in send with the arena already released
        let first = timeout(Duration::from_secs(5), pump.recv()).await.expect("first").expect("packet");
        assert_eq!(first.index, 0);
        for expected in 1..3 {
            let packet = timeout(Duration::from_secs(5), pump.recv()).await.expect("next").expect("packet");
            assert_eq!(packet.index, expected);
        }
        assert_eq!(pump.stop().await.expect("stop"), 3);
    }
}
