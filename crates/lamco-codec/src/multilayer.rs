//! Multi-Layer Encoding
//!
//! One input picture, several encoded renditions. Every layer is an
//! [`EncoderCore`] over the same shared input frames; layers whose
//! resolution differs from the input resize through their own chain.
//!
//! The first layer's device session owns the hardware timeline and every
//! later session joins it. Inputs are queued on all layers in lockstep, so
//! the slowest layer sets the pace.
//!
//! # Examples
//!
//! ```rust
//! use lamco_codec::config::CodecConfig;
//! use lamco_codec::multilayer::MultiLayerEncoder;
//! use lamco_codec::sim::SimulatedSession;
//! use lamco_surface::SystemAllocator;
//!
//! # fn main() -> lamco_codec::Result<()> {
//! let full = CodecConfig::builder().resolution(64, 64).output_size_max(8192).build();
//! let half = CodecConfig::builder().resolution(32, 32).output_size_max(8192).build();
//!
//! let mut encoder = MultiLayerEncoder::new(Box::new(SystemAllocator::new()), &full)?;
//! encoder.add_layer(full, Box::new(SimulatedSession::new()))?;
//! encoder.add_layer(half, Box::new(SimulatedSession::new()))?;
//!
//! assert!(encoder.push_input(|input| {
//!     input.write_luma(&[16; 64]);
//!     Ok(())
//! })?);
//! let delivered = encoder.run(|layer, frame, bytes| {
//!     println!("layer {layer}: frame {} is {} bytes", frame.frame_index(), bytes.len());
//! })?;
//! assert_eq!(delivered, 2);
//! # Ok(())
//! # }
//! ```

use tracing::{debug, info, trace, warn};

use lamco_surface::{AllocRequest, AllocResponse, FrameAllocator, FrameInfo};

use crate::config::CodecConfig;
use crate::encoder::{EncodedFrame, EncoderCore, InputBuffer};
use crate::error::{CodecError, Result};
use crate::hardware::{HardwareSession, TimelineId};

/// Frames in the shared input allocation
pub const SHARED_INPUT_FRAMES: usize = 8;

/// Layered encoder over one shared input allocation
pub struct MultiLayerEncoder {
    layers: Vec<EncoderCore>,
    base_timeline: Option<TimelineId>,
    shared: AllocResponse,
    frames: Box<dyn FrameAllocator>,
}

impl MultiLayerEncoder {
    /// Allocate the shared input frames described by `input`
    ///
    /// Uses the input format, size and memory type of `input`.
    pub fn new(frames: Box<dyn FrameAllocator>, input: &CodecConfig) -> Result<Self> {
        info!(
            "Creating multi-layer encoder with {}x{} {:?} input",
            input.width, input.height, input.input_format
        );
        let request = AllocRequest::new(
            EncoderCore::input_info(input),
            SHARED_INPUT_FRAMES,
            EncoderCore::input_mem_type(input),
        );
        let shared = frames.alloc_frames(&request)?;
        Ok(Self {
            layers: Vec::new(),
            base_timeline: None,
            shared,
            frames,
        })
    }

    /// Shared input geometry
    #[must_use]
    pub fn input_info(&self) -> FrameInfo {
        self.shared.info
    }

    /// Number of layers
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer was added
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer `index`
    #[must_use]
    pub fn layer(&self, index: usize) -> Option<&EncoderCore> {
        self.layers.get(index)
    }

    /// Add a layer encoding with `config` on `hw`
    ///
    /// Every layer after the first joins the first layer's timeline.
    /// Returns the layer index.
    pub fn add_layer(&mut self, config: CodecConfig, mut hw: Box<dyn HardwareSession>) -> Result<usize> {
        if let Some(base) = self.base_timeline {
            hw.join(base)?;
        }

        let core = EncoderCore::allocate_shared(config, hw, self.frames.as_ref(), self.shared.clone())?;
        if self.base_timeline.is_none() {
            self.base_timeline = Some(core.timeline());
        }

        let index = self.layers.len();
        debug!(
            "Layer {}: {}x{} over shared {}x{} input",
            index,
            core.config().width,
            core.config().height,
            self.shared.info.width,
            self.shared.info.height
        );
        self.layers.push(core);
        Ok(index)
    }

    /// Fill one input with `copy` and queue it on every layer
    ///
    /// `Ok(false)` when any layer has no room.
    pub fn push_input(&self, copy: impl FnOnce(&InputBuffer) -> Result<()>) -> Result<bool> {
        let Some((base, rest)) = self.layers.split_first() else {
            return Err(CodecError::not_initialized("multi-layer encoder has no layers"));
        };
        let frames = self.frames.as_ref();

        if !self.layers.iter().all(EncoderCore::can_accept) {
            trace!("A layer is full, input refused");
            return Ok(false);
        }

        let Some(buffer) = base.dequeue_input_buffer(frames)? else {
            return Ok(false);
        };
        if let Err(e) = copy(&buffer) {
            base.abandon_input_buffer(frames, buffer)?;
            return Err(e);
        }

        for (i, layer) in rest.iter().enumerate() {
            let Some(mirror) = layer.dequeue_input_unmapped(frames)? else {
                base.abandon_input_buffer(frames, buffer)?;
                return Err(CodecError::PoolExhausted(format!("layer {} fell out of step", i + 1)));
            };
            if mirror.surface != buffer.surface {
                warn!(
                    "Layer {} is at {:?}, base is at {:?}",
                    i + 1,
                    mirror.surface,
                    buffer.surface
                );
            }
            layer.queue_input_buffer(frames, mirror)?;
        }

        base.queue_input_buffer(frames, buffer)
    }

    /// Collect at most one encoded frame from each layer
    ///
    /// `on_frame` sees non-empty frames as `(layer, frame, bytes)`. Every
    /// frame is released afterwards. Returns the number delivered.
    pub fn run(&self, mut on_frame: impl FnMut(usize, &EncodedFrame, &[u8])) -> Result<usize> {
        let frames = self.frames.as_ref();
        let mut delivered = 0;

        for (index, layer) in self.layers.iter().enumerate() {
            let Some(frame) = layer.dequeue_output_buffer(frames, None)? else {
                continue;
            };
            if !frame.is_empty() {
                let shown = layer.with_output(&frame, |bytes| on_frame(index, &frame, bytes));
                if let Err(e) = shown {
                    layer.release_output_buffer(frame);
                    return Err(e);
                }
                delivered += 1;
            }
            layer.release_output_buffer(frame);
        }

        Ok(delivered)
    }
}

impl Drop for MultiLayerEncoder {
    fn drop(&mut self) {
        let frames = self.frames.as_ref();
        for (index, layer) in self.layers.iter().enumerate() {
            if let Err(e) = layer.deallocate(frames) {
                warn!("Layer {} teardown failed: {}", index, e);
            }
            if index > 0 {
                if let Err(e) = layer.disjoin() {
                    warn!("Layer {} could not leave the base timeline: {}", index, e);
                }
            }
        }
        self.layers.clear();

        if let Err(e) = frames.free_frames(&self.shared) {
            warn!("Failed to free shared input frames: {}", e);
        }
        debug!("Dropping multi-layer encoder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{parse_unit, SimulatedSession, Unit};
    use lamco_surface::SystemAllocator;

    fn layer_config(width: u32, height: u32) -> CodecConfig {
        CodecConfig::builder()
            .resolution(width, height)
            .output_size_max(4096)
            .build()
    }

    fn encoder(layers: &[(u32, u32)]) -> MultiLayerEncoder {
        let mut encoder =
            MultiLayerEncoder::new(Box::new(SystemAllocator::new()), &layer_config(64, 64)).expect("encoder");
        for &(w, h) in layers {
            encoder
                .add_layer(layer_config(w, h), Box::new(SimulatedSession::new()))
                .expect("layer");
        }
        encoder
    }

    fn fill(value: u8) -> impl FnOnce(&InputBuffer) -> Result<()> {
        move |input: &InputBuffer| {
            input.write_luma(&[value; 128]);
            Ok(())
        }
    }

    #[test]
    fn test_layers_share_timeline() {
        let encoder = encoder(&[(64, 64), (32, 32), (16, 16)]);
        let base = encoder.layer(0).expect("base").timeline();
        assert_eq!(encoder.layer(1).expect("layer").timeline(), base);
        assert_eq!(encoder.layer(2).expect("layer").timeline(), base);
        assert!(!encoder.layer(0).expect("base").has_chain());
        assert!(encoder.layer(1).expect("layer").has_chain());
    }

    #[test]
    fn test_every_layer_encodes_each_input() {
        let encoder = encoder(&[(64, 64), (32, 32)]);
        for i in 0..3 {
            assert!(encoder.push_input(fill(i)).expect("push"));
        }

        let mut seen: Vec<(usize, u64, usize)> = Vec::new();
        for _ in 0..3 {
            let delivered = encoder
                .run(|layer, frame, bytes| seen.push((layer, frame.frame_index(), bytes.len())))
                .expect("run");
            assert_eq!(delivered, 2);
        }

        let base: Vec<u64> = seen.iter().filter(|s| s.0 == 0).map(|s| s.1).collect();
        let half: Vec<u64> = seen.iter().filter(|s| s.0 == 1).map(|s| s.1).collect();
        assert_eq!(base, vec![0, 1, 2]);
        assert_eq!(half, vec![0, 1, 2]);

        // Smaller pictures give smaller frames
        let size = |layer: usize| seen.iter().find(|s| s.0 == layer).map(|s| s.2).expect("frame");
        assert!(size(1) < size(0));
    }

    #[test]
    fn test_layer_bitstream_has_own_geometry() {
        let encoder = encoder(&[(64, 64), (32, 32)]);
        assert!(encoder.push_input(fill(1)).expect("push"));

        let mut headers = Vec::new();
        encoder
            .run(|_, _, bytes| {
                if let Ok(Some((Unit::Header(payload), _))) = parse_unit(bytes) {
                    headers.push(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]));
                }
            })
            .expect("run");
        assert_eq!(headers, vec![64, 32]);
    }

    #[test]
    fn test_backpressure_across_layers() {
        let encoder = encoder(&[(64, 64), (32, 32)]);
        for i in 0..SHARED_INPUT_FRAMES {
            assert!(encoder.push_input(fill(i as u8)).expect("push"));
        }
        assert!(!encoder.push_input(fill(0)).expect("full"));

        assert_eq!(encoder.run(|_, _, _| {}).expect("run"), 2);
        assert!(encoder.push_input(fill(0)).expect("room again"));
    }

    #[test]
    fn test_failed_copy_releases_input() {
        let encoder = encoder(&[(64, 64), (32, 32)]);
        let err = encoder
            .push_input(|_| Err(CodecError::invalid_config("copy failed")))
            .expect_err("copy error");
        assert!(matches!(err, CodecError::InvalidConfig(_)));
        assert!(encoder.push_input(fill(3)).expect("push"));
    }

    #[test]
    fn test_gpu_layers_share_one_mapping() {
        use crate::config::MemoryType;
        use lamco_surface::{GpuAllocator, HostTextureDevice};
        use std::sync::Arc;

        let gpu = CodecConfig {
            memory_type: MemoryType::InternalGpu,
            ..layer_config(64, 64)
        };
        let device = Arc::new(HostTextureDevice::new());
        let mut encoder =
            MultiLayerEncoder::new(Box::new(GpuAllocator::new(device, false)), &gpu).expect("encoder");
        encoder
            .add_layer(gpu.clone(), Box::new(SimulatedSession::new()))
            .expect("base");
        encoder.add_layer(gpu, Box::new(SimulatedSession::new())).expect("layer");

        for i in 0..2 {
            assert!(encoder.push_input(fill(i)).expect("push"));
        }
        assert_eq!(encoder.run(|_, _, _| {}).expect("run"), 2);
        assert_eq!(encoder.run(|_, _, _| {}).expect("run"), 2);
    }

    #[test]
    fn test_no_layers() {
        let encoder = encoder(&[]);
        assert!(encoder.is_empty());
        assert!(matches!(
            encoder.push_input(fill(0)),
            Err(CodecError::NotInitialized(_))
        ));
    }
}
