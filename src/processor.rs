use crate::buffer::{AudioBuffer, Sample};
use crate::error::ProcessError;

/// Audio-processing capability invoked once per buffer period on the driver
/// thread. Frame and channel counts are carried by the buffers.
pub trait FrameProcessor: Send {
    fn process(
        &mut self,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> Result<(), ProcessError>;
}

impl<F> FrameProcessor for F
where
    F: FnMut(&AudioBuffer<'_>, &mut AudioBuffer<'_>) -> Result<(), ProcessError> + Send,
{
    fn process(
        &mut self,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> Result<(), ProcessError> {
        self(input, output)
    }
}

/// Turn a closure into a [`FrameProcessor`], pinning down its signature so
/// the buffer lifetimes are inferred correctly.
pub fn process_fn<F>(f: F) -> F
where
    F: FnMut(&AudioBuffer<'_>, &mut AudioBuffer<'_>) -> Result<(), ProcessError> + Send,
{
    f
}

/// Copies input channels to the matching output channels; extra output
/// channels are silenced.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl FrameProcessor for Passthrough {
    fn process(
        &mut self,
        input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> Result<(), ProcessError> {
        let in_channels = input.channels();
        let out_channels = output.channels();
        let frames = input.frames().min(output.frames());
        let src = input.as_slice();
        let dst = output.as_mut_slice();
        for frame in 0..frames {
            for ch in 0..out_channels {
                dst[frame * out_channels + ch] = if ch < in_channels {
                    src[frame * in_channels + ch]
                } else {
                    0.0
                };
            }
        }
        Ok(())
    }
}

/// A sine test tone written to every output channel.
#[derive(Debug, Clone)]
pub struct SineTone {
    amplitude: Sample,
    phase: f64,
    phase_delta: f64,
}

impl SineTone {
    pub fn new(frequency: f64, sample_rate: u32) -> Self {
        SineTone {
            amplitude: 0.2,
            phase: 0.0,
            phase_delta: std::f64::consts::TAU * frequency.max(0.0) / f64::from(sample_rate.max(1)),
        }
    }

    pub fn with_amplitude(mut self, amplitude: Sample) -> Self {
        self.amplitude = amplitude;
        self
    }
}

impl FrameProcessor for SineTone {
    fn process(
        &mut self,
        _input: &AudioBuffer<'_>,
        output: &mut AudioBuffer<'_>,
    ) -> Result<(), ProcessError> {
        let channels = output.channels().max(1);
        for frame in output.as_mut_slice().chunks_exact_mut(channels) {
            let value = self.amplitude * self.phase.sin() as Sample;
            frame.fill(value);
            self.phase = (self.phase + self.phase_delta) % std::f64::consts::TAU;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_maps_channels() {
        let mut input: Vec<Sample> = vec![1.0, 2.0, 3.0, 4.0];
        let mut output: Vec<Sample> = vec![9.0; 6];
        let input = AudioBuffer::from_slice(&mut input, 1);
        let mut out = AudioBuffer::from_slice(&mut output, 2);
        // 4 input frames, 3 output frames
        Passthrough.process(&input, &mut out).unwrap();
        assert_eq!(output, vec![1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn sine_tone_stays_in_range_and_matches_across_channels() {
        let mut tone = SineTone::new(440.0, 48_000).with_amplitude(0.5);
        let mut input: Vec<Sample> = Vec::new();
        let mut output: Vec<Sample> = vec![0.0; 256 * 2];
        let input = AudioBuffer::from_slice(&mut input, 2);
        let mut out = AudioBuffer::from_slice(&mut output, 2);
        tone.process(&input, &mut out).unwrap();
        assert!(output.iter().all(|s| s.abs() <= 0.5));
        assert!(output.chunks(2).all(|f| f[0] == f[1]));
        assert!(output.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn closures_are_processors() {
        let mut calls = 0;
        let mut processor = process_fn(|_, out| {
            calls += 1;
            out.fill(1.0);
            Ok(())
        });
        let mut input: Vec<Sample> = vec![];
        let mut output: Vec<Sample> = vec![0.0; 4];
        let input = AudioBuffer::from_slice(&mut input, 0);
        let mut out = AudioBuffer::from_slice(&mut output, 2);
        processor.process(&input, &mut out).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(output, vec![1.0; 4]);
    }
}
