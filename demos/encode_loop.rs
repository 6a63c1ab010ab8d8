//! Encode / Decode Loop Example
//!
//! Runs a producer thread that fills input surfaces while the main thread
//! drains encoded frames, then feeds the bitstream back through a decoder.
//! Both sessions use the simulated hardware backend.
//!
//! # Running
//!
//! ```bash
//! cargo run --example encode_loop
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lamco_hwcodec::codec::sim::SimulatedSession;
use lamco_hwcodec::codec::{CodecConfig, CodecKind, DecodeSession, EncodeSession, RateControlMode};
use lamco_hwcodec::surface::SystemAllocator;

const FRAMES: u8 = 30;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    println!("lamco-hwcodec Encode Loop Example");
    println!("=================================");

    let config = CodecConfig::builder()
        .codec(CodecKind::Avc)
        .resolution(64, 64)
        .async_depth(3)
        .rc_mode(RateControlMode::Auto)
        .bitrate_kbps(64)
        .output_size_max(8192)
        .build();

    println!("Configuration:");
    println!("  Resolution: {}x{}", config.width, config.height);
    println!("  Async depth: {}", config.async_depth);
    println!("  Rate control: {:?}", config.rc_mode);

    let encoder = Arc::new(EncodeSession::allocate(
        config,
        Box::new(SimulatedSession::new()),
        Box::new(SystemAllocator::new()),
    )?);

    let producer = {
        let encoder = Arc::clone(&encoder);
        thread::spawn(move || -> lamco_hwcodec::codec::Result<()> {
            let mut next = 0u8;
            while next < FRAMES {
                match encoder.dequeue_input_buffer()? {
                    Some(input) => {
                        input.write_luma(&[next.wrapping_mul(8); 64 * 64]);
                        if encoder.queue_input_buffer(input)? {
                            next += 1;
                        }
                    }
                    None => thread::sleep(Duration::from_millis(1)),
                }
            }
            Ok(())
        })
    };

    let mut stream = Vec::new();
    while stream.len() < usize::from(FRAMES) {
        match encoder.dequeue_output_buffer(Some(Duration::from_millis(10)))? {
            Some(frame) => {
                println!("  frame {:>2}: {:>4} bytes at QP {}", frame.frame_index(), frame.len(), frame.qp());
                stream.push(encoder.output_bytes(&frame)?);
                encoder.release_output_buffer(frame);
            }
            None => thread::yield_now(),
        }
    }
    producer.join().map_err(|_| "producer thread panicked")??;

    let stats = encoder.stats();
    println!("\nEncoded {} frames, {} bytes average", stats.frames_encoded, stats.average_frame_size());

    let header = stream.first().ok_or("no encoded output")?;
    let decoder = DecodeSession::allocate(
        CodecConfig::decode(CodecKind::Avc, 0, 0),
        Box::new(SimulatedSession::new()),
        Box::new(SystemAllocator::new()),
        header,
    )?;
    println!("Decoder opened at {}x{}", decoder.config().width, decoder.config().height);

    let mut decoded = 0;
    for unit in &stream {
        while !decoder.queue_input_buffer(Some(unit))? {
            drain(&decoder, &mut decoded)?;
        }
        drain(&decoder, &mut decoded)?;
    }
    while !decoder.queue_input_buffer(None)? {
        drain(&decoder, &mut decoded)?;
    }
    drain(&decoder, &mut decoded)?;

    println!("Decoded {} frames", decoded);
    Ok(())
}

fn drain(decoder: &DecodeSession, decoded: &mut usize) -> lamco_hwcodec::codec::Result<()> {
    while let Some(frame) = decoder.dequeue_output_buffer()? {
        *decoded += 1;
        decoder.release_output_buffer(frame.handle)?;
    }
    Ok(())
}
