//! Audio mixer
//!
//! Microphone and reference-track audio feed one mix destination, each
//! connected at most once per session. The reference is also teed to a
//! monitor output so the performer can hear it. The mixed stream is handed
//! to the capture side exactly once.

use super::convert::ConvertedInput;
use crate::capture::traits::{AudioFormat, AudioInput, MonitorOutput};
use crate::reference::ReferencePlayer;
use crate::utils::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mixer configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerSettings {
    pub format: AudioFormat,
    pub microphone_gain: f32,
    pub reference_gain: f32,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self {
            format: AudioFormat::new(48_000, 2),
            microphone_gain: 1.0,
            reference_gain: 1.0,
        }
    }
}

struct MixInput {
    track: Box<dyn AudioInput>,
    gain: f32,
    scratch: Vec<f32>,
}

impl MixInput {
    fn new(track: Box<dyn AudioInput>, gain: f32) -> Self {
        Self {
            track,
            gain,
            scratch: Vec::new(),
        }
    }

    /// Read `len` samples into scratch; returns how many are valid
    fn pull(&mut self, len: usize) -> usize {
        self.scratch.clear();
        self.scratch.resize(len, 0.0);
        self.track.read(&mut self.scratch).min(len)
    }
}

#[derive(Default)]
struct MixerGraph {
    microphone: Option<MixInput>,
    reference: Option<MixInput>,
    monitor: Option<Box<dyn MonitorOutput>>,
    microphone_connected: bool,
    reference_connected: bool,
    closed: bool,
}

/// Owns the mix graph for one session
pub struct AudioMixer {
    settings: MixerSettings,
    graph: Arc<Mutex<MixerGraph>>,
    output_taken: AtomicBool,
}

impl AudioMixer {
    pub fn new(settings: MixerSettings) -> Self {
        Self {
            settings,
            graph: Arc::new(Mutex::new(MixerGraph::default())),
            output_taken: AtomicBool::new(false),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.settings.format
    }

    /// Feed the raw microphone track into the mix
    pub fn connect_microphone(&self, track: Box<dyn AudioInput>) -> SessionResult<()> {
        let mut graph = self.graph.lock();
        if graph.closed {
            return Err(SessionError::InvalidState("audio mixer closed".to_string()));
        }
        if graph.microphone_connected {
            return Err(SessionError::AlreadyConnected("microphone".to_string()));
        }

        let track = ConvertedInput::wrap(track, self.settings.format);
        graph.microphone = Some(MixInput::new(track, self.settings.microphone_gain));
        graph.microphone_connected = true;
        tracing::info!("Microphone connected to mix");
        Ok(())
    }

    /// Feed the reference audio into the mix and the monitor output.
    ///
    /// The reference must already report can-play; connecting earlier would
    /// yield a silent source.
    pub fn connect_reference_audio(
        &self,
        player: &dyn ReferencePlayer,
        monitor: Box<dyn MonitorOutput>,
    ) -> SessionResult<()> {
        let mut graph = self.graph.lock();
        if graph.closed {
            return Err(SessionError::InvalidState("audio mixer closed".to_string()));
        }
        if graph.reference_connected {
            return Err(SessionError::AlreadyConnected("reference audio".to_string()));
        }
        if !player.can_play() {
            return Err(SessionError::InvalidState(
                "reference track not ready to play".to_string(),
            ));
        }
        let track = player
            .take_audio()
            .ok_or_else(|| SessionError::AlreadyConnected("reference audio".to_string()))?;

        let track = ConvertedInput::wrap(track, self.settings.format);
        graph.reference = Some(MixInput::new(track, self.settings.reference_gain));
        graph.monitor = Some(monitor);
        graph.reference_connected = true;
        tracing::info!("Reference audio connected to mix and monitor");
        Ok(())
    }

    pub fn is_microphone_connected(&self) -> bool {
        self.graph.lock().microphone_connected
    }

    pub fn is_reference_connected(&self) -> bool {
        self.graph.lock().reference_connected
    }

    /// The mix destination's output track. Available once.
    pub fn output(&self) -> SessionResult<MixedAudioOutput> {
        if self.output_taken.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyConnected("mixed audio output".to_string()));
        }
        Ok(MixedAudioOutput {
            graph: self.graph.clone(),
            format: self.settings.format,
        })
    }

    /// Tear down the graph. Fails if already closed.
    pub fn close(&self) -> SessionResult<()> {
        let mut graph = self.graph.lock();
        if graph.closed {
            return Err(SessionError::InvalidState(
                "audio mixer already closed".to_string(),
            ));
        }
        graph.closed = true;
        graph.microphone = None;
        graph.reference = None;
        graph.monitor = None;
        tracing::info!("Audio mixer closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.graph.lock().closed
    }
}

/// Read side of the mix destination
pub struct MixedAudioOutput {
    graph: Arc<Mutex<MixerGraph>>,
    format: AudioFormat,
}

impl MixedAudioOutput {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Mix the next `frames` sample frames. Missing input is silence.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let len = self.format.samples_for_frames(frames);
        let mut out = vec![0.0f32; len];
        let mut graph = self.graph.lock();
        if graph.closed {
            return out;
        }
        let graph = &mut *graph;

        if let Some(mic) = graph.microphone.as_mut() {
            let n = mic.pull(len);
            for (o, s) in out.iter_mut().zip(&mic.scratch[..n]) {
                *o += s * mic.gain;
            }
        }

        if let Some(reference) = graph.reference.as_mut() {
            let n = reference.pull(len);
            if let Some(monitor) = graph.monitor.as_mut() {
                monitor.write(&reference.scratch[..n], self.format);
            }
            for (o, s) in out.iter_mut().zip(&reference.scratch[..n]) {
                *o += s * reference.gain;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMicrophone, FakeReference, RecordingMonitor};

    fn settings() -> MixerSettings {
        MixerSettings::default()
    }

    #[test]
    fn test_mixes_both_inputs_and_clamps() {
        let mixer = AudioMixer::new(settings());
        mixer
            .connect_microphone(Box::new(FakeMicrophone::constant(48_000, 2, 0.25)))
            .unwrap();
        let reference = FakeReference::ready();
        reference.set_audio_level(0.5);
        mixer
            .connect_reference_audio(&reference, Box::new(RecordingMonitor::default()))
            .unwrap();

        let output = mixer.output().unwrap();
        let mixed = output.pull(10);
        assert_eq!(mixed.len(), 20);
        assert!(mixed.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        let loud = AudioMixer::new(MixerSettings {
            microphone_gain: 8.0,
            ..settings()
        });
        loud.connect_microphone(Box::new(FakeMicrophone::constant(48_000, 2, 0.5)))
            .unwrap();
        assert!(loud.output().unwrap().pull(4).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn test_reference_connects_once() {
        let mixer = AudioMixer::new(settings());
        let reference = FakeReference::ready();
        mixer
            .connect_reference_audio(&reference, Box::new(RecordingMonitor::default()))
            .unwrap();
        let err = mixer
            .connect_reference_audio(&reference, Box::new(RecordingMonitor::default()))
            .unwrap_err();

        assert!(matches!(err, SessionError::AlreadyConnected(_)));
        assert_eq!(reference.audio_takes(), 1);
    }

    #[test]
    fn test_reference_must_be_ready() {
        let mixer = AudioMixer::new(settings());
        let reference = FakeReference::not_ready();
        let err = mixer
            .connect_reference_audio(&reference, Box::new(RecordingMonitor::default()))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert!(!mixer.is_reference_connected());
    }

    #[test]
    fn test_monitor_hears_reference_only() {
        let mixer = AudioMixer::new(settings());
        mixer
            .connect_microphone(Box::new(FakeMicrophone::constant(48_000, 2, 0.25)))
            .unwrap();
        let reference = FakeReference::ready();
        reference.set_audio_level(0.5);
        let monitor = RecordingMonitor::default();
        let heard = monitor.samples();
        mixer
            .connect_reference_audio(&reference, Box::new(monitor))
            .unwrap();

        mixer.output().unwrap().pull(8);
        let heard = heard.lock();
        assert_eq!(heard.len(), 16);
        assert!(heard.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_output_taken_once_and_close_twice_fails() {
        let mixer = AudioMixer::new(settings());
        let output = mixer.output().unwrap();
        assert!(mixer.output().is_err());

        mixer.close().unwrap();
        assert!(mixer.close().is_err());
        assert!(output.pull(4).iter().all(|&s| s == 0.0));
        assert!(mixer
            .connect_microphone(Box::new(FakeMicrophone::silent(48_000, 2)))
            .is_err());
    }
}
