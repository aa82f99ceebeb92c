//! Format conversion for audio inputs
//!
//! Devices deliver whatever rate and channel layout they like; the mix runs
//! in one format. Channel mapping plus linear interpolation is enough for
//! speech and a backing track.

use crate::capture::traits::{AudioFormat, AudioInput};
use std::collections::VecDeque;

/// Map one interleaved frame from `from` channels to `to` channels
fn remap_frame(frame: &[f32], to: usize, out: &mut VecDeque<f32>) {
    let from = frame.len();
    match (from, to) {
        (f, t) if f == t => out.extend(frame.iter().copied()),
        (1, t) => out.extend(std::iter::repeat(frame[0]).take(t)),
        (f, 1) => out.push_back(frame.iter().sum::<f32>() / f as f32),
        (f, t) => out.extend((0..t).map(|c| frame[c.min(f - 1)])),
    }
}

/// Wraps an input so it yields samples in `target` format
pub struct ConvertedInput {
    source: Box<dyn AudioInput>,
    from: AudioFormat,
    to: AudioFormat,
    /// Source-rate frames already remapped to the target channel count
    pending: VecDeque<f32>,
    /// Fractional read position into `pending`, in frames
    position: f64,
    scratch: Vec<f32>,
}

impl ConvertedInput {
    pub fn new(source: Box<dyn AudioInput>, target: AudioFormat) -> Self {
        let from = source.format();
        Self {
            source,
            from,
            to: target,
            pending: VecDeque::new(),
            position: 0.0,
            scratch: Vec::new(),
        }
    }

    /// Box `source`, converting only when its format differs from `target`
    pub fn wrap(source: Box<dyn AudioInput>, target: AudioFormat) -> Box<dyn AudioInput> {
        if source.format() == target {
            source
        } else {
            tracing::debug!(
                "Converting audio input {}Hz/{}ch -> {}Hz/{}ch",
                source.format().sample_rate,
                source.format().channels,
                target.sample_rate,
                target.channels
            );
            Box::new(Self::new(source, target))
        }
    }

    fn pending_frames(&self) -> usize {
        self.pending.len() / self.to.channels.max(1) as usize
    }

    /// Pull enough source samples to produce `frames` output frames
    fn fill(&mut self, frames: usize) {
        let ratio = self.from.sample_rate as f64 / self.to.sample_rate as f64;
        let needed = (self.position + frames as f64 * ratio).ceil() as usize + 2;
        let have = self.pending_frames();
        if needed <= have {
            return;
        }

        let from_channels = self.from.channels.max(1) as usize;
        let to_channels = self.to.channels.max(1) as usize;
        self.scratch.resize((needed - have) * from_channels, 0.0);
        let read = self.source.read(&mut self.scratch);
        for frame in self.scratch[..read - read % from_channels].chunks_exact(from_channels) {
            remap_frame(frame, to_channels, &mut self.pending);
        }
    }
}

impl AudioInput for ConvertedInput {
    fn format(&self) -> AudioFormat {
        self.to
    }

    fn read(&mut self, out: &mut [f32]) -> usize {
        let channels = self.to.channels.max(1) as usize;
        let frames = out.len() / channels;
        self.fill(frames);

        let ratio = self.from.sample_rate as f64 / self.to.sample_rate as f64;
        let available = self.pending_frames();
        let mut written = 0;

        for frame in 0..frames {
            let index = self.position.floor() as usize;
            if index + 1 >= available {
                break;
            }
            let frac = (self.position - index as f64) as f32;
            for c in 0..channels {
                let a = self.pending[index * channels + c];
                let b = self.pending[(index + 1) * channels + c];
                out[frame * channels + c] = a + (b - a) * frac;
            }
            written += channels;
            self.position += ratio;
        }

        // Drop fully consumed frames
        let consumed = (self.position.floor() as usize).min(available);
        self.pending.drain(..consumed * channels);
        self.position -= consumed as f64;

        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMicrophone;

    #[test]
    fn test_mono_to_stereo_same_rate_passthrough_values() {
        let mic = FakeMicrophone::constant(48_000, 1, 0.5);
        let mut input = ConvertedInput::new(Box::new(mic), AudioFormat::new(48_000, 2));

        let mut out = vec![0.0; 96];
        let written = input.read(&mut out);
        assert_eq!(written, 96);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_downsampling_produces_requested_length() {
        let mic = FakeMicrophone::ramp(44_100, 2);
        let mut input = ConvertedInput::new(Box::new(mic), AudioFormat::new(48_000, 2));

        let mut total = 0;
        for _ in 0..10 {
            let mut out = vec![0.0; 960];
            total += input.read(&mut out);
        }
        assert_eq!(total, 9600);
    }

    #[test]
    fn test_wrap_skips_matching_format() {
        let mic = FakeMicrophone::constant(48_000, 2, 0.1);
        let wrapped = ConvertedInput::wrap(Box::new(mic), AudioFormat::new(48_000, 2));
        assert_eq!(wrapped.format(), AudioFormat::new(48_000, 2));
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let mut pending = VecDeque::new();
        remap_frame(&[0.2, 0.6], 1, &mut pending);
        assert!((pending[0] - 0.4).abs() < 1e-6);
    }
}
