//! Linear-interpolation resampling for clip buffers
//!
//! Not a band-limited resampler. Clip buffers only need to land on the
//! engine's rate; quality resampling happens upstream when assets are made.

/// Number of output frames when converting `input_frames` from `source_rate`
/// to `target_rate`. Never less than one.
pub fn output_frames(input_frames: usize, source_rate: u32, target_rate: u32) -> usize {
    let ratio = target_rate as f64 / source_rate as f64;
    ((input_frames as f64 * ratio).round() as usize).max(1)
}

/// Resample one channel by linear interpolation.
///
/// Output sample `i` reads source position `i / ratio`, blending the floor and
/// ceil neighbours. A neighbour past the end clamps to the last sample.
pub fn resample_linear(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if input.is_empty() {
        return Vec::new();
    }
    if source_rate == target_rate {
        return input.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let out_frames = output_frames(input.len(), source_rate, target_rate);
    let last = input.len() - 1;

    (0..out_frames)
        .map(|i| {
            let position = i as f64 / ratio;
            let lo = (position.floor() as usize).min(last);
            let hi = (position.ceil() as usize).min(last);
            let frac = (position - position.floor()) as f32;
            let a = input[lo];
            let b = input[hi];
            a + (b - a) * frac
        })
        .collect()
}

/// Resample every channel of a buffer.
pub fn resample_channels(channels: &[Vec<f32>], source_rate: u32, target_rate: u32) -> Vec<Vec<f32>> {
    channels
        .iter()
        .map(|channel| resample_linear(channel, source_rate, target_rate))
        .collect()
}
