//! Deterministic WAV fixtures
//!
//! Encoded in memory so tests can hand them to `MemoryTransport` directly.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::f32::consts::PI;
use std::io::Cursor;

/// Fixture sample rate; low to keep decode fast
pub const TEST_SAMPLE_RATE: u32 = 8000;

fn encode(duration_ms: u64, channels: u16, sample: impl Fn(u64) -> i16) -> Vec<u8> {
    let spec = WavSpec {
        channels,
        sample_rate: TEST_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let frames = TEST_SAMPLE_RATE as u64 * duration_ms / 1000;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec).expect("wav header");
        for frame in 0..frames {
            let value = sample(frame);
            for _ in 0..channels {
                writer.write_sample(value).expect("wav sample");
            }
        }
        writer.finalize().expect("wav finalize");
    }
    cursor.into_inner()
}

/// Stereo silence
pub fn silent_wav(duration_ms: u64) -> Vec<u8> {
    encode(duration_ms, 2, |_| 0)
}

/// Mono sine at `frequency` Hz, half amplitude
pub fn sine_wav(duration_ms: u64, frequency: f32) -> Vec<u8> {
    encode(duration_ms, 1, |frame| {
        let t = frame as f32 / TEST_SAMPLE_RATE as f32;
        ((2.0 * PI * frequency * t).sin() * i16::MAX as f32 * 0.5) as i16
    })
}
