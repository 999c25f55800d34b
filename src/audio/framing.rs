//! Sample conversion and frame assembly
//!
//! The capture callback hands over arbitrary-sized interleaved buffers at the
//! device rate. These helpers turn them into fixed-size mono frames at the
//! rate the recognizer expects.

use super::AudioFrame;

/// Average interleaved channels down to mono
pub fn interleaved_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Downsample audio from source rate to target rate using simple averaging
///
/// Only integer ratios are handled here (e.g., 48kHz → 16kHz).
/// Returns `None` for other ratios so the caller can fall back to
/// [`resample_linear`].
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Option<Vec<i16>> {
    if target_rate == 0 || source_rate == 0 || source_rate < target_rate {
        return None;
    }

    if source_rate == target_rate {
        return Some(samples.to_vec());
    }

    if source_rate % target_rate != 0 {
        return None;
    }

    let ratio = (source_rate / target_rate) as usize;

    Some(
        samples
            .chunks(ratio)
            .map(|chunk| {
                // i64 prevents overflow with large ratios
                let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
                (sum / chunk.len() as i64) as i16
            })
            .collect(),
    )
}

/// Linear-interpolation resampler for non-integer ratios (e.g., 44.1kHz → 16kHz)
///
/// Each call is independent, so there may be a tiny discontinuity at buffer
/// boundaries. That is inaudible to a wake word recognizer.
pub fn resample_linear(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }
    if source_rate == target_rate {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let step = source_rate as f64 / target_rate as f64;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(samples.len() - 1)] as f64;
            let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Accumulates resampled audio and cuts it into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: Vec<i16>,
    frame_samples: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            buffer: Vec::with_capacity(frame_samples * 2),
            frame_samples,
            sample_rate,
        }
    }

    /// Add samples and return every frame that is now complete
    pub fn push(&mut self, samples: &[i16]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_samples {
            let chunk: Vec<i16> = self.buffer.drain(..self.frame_samples).collect();
            frames.push(AudioFrame {
                samples: chunk,
                sample_rate: self.sample_rate,
            });
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_averages_channels() {
        assert_eq!(interleaved_to_mono(&[100, 200, -50, 50], 2), vec![150, 0]);
        assert_eq!(interleaved_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn test_downsample_integer_ratio() {
        let out = downsample(&[3, 3, 3, 6, 6, 6], 48000, 16000).unwrap();
        assert_eq!(out, vec![3, 6]);
        assert_eq!(downsample(&[1, 2], 16000, 16000).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_downsample_rejects_other_ratios() {
        assert!(downsample(&[0; 10], 44100, 16000).is_none());
        assert!(downsample(&[0; 10], 8000, 16000).is_none());
        assert!(downsample(&[0; 10], 0, 16000).is_none());
    }

    #[test]
    fn test_resample_linear_length() {
        let input = vec![0i16; 44100];
        let out = resample_linear(&input, 44100, 16000);
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_resample_linear_interpolates() {
        // Upsampling a ramp keeps it monotonic
        let out = resample_linear(&[0, 100], 1, 2);
        assert_eq!(out, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_assembler_cuts_fixed_frames() {
        let mut assembler = FrameAssembler::new(4, 16000);

        assert!(assembler.push(&[1, 2, 3]).is_empty());
        assert_eq!(assembler.buffer.len(), 3);

        let frames = assembler.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![1, 2, 3, 4]);
        assert_eq!(frames[1].samples, vec![5, 6, 7, 8]);
        assert_eq!(frames[1].sample_rate, 16000);
        assert_eq!(assembler.buffer.len(), 1);
    }
}
