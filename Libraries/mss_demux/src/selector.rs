//! Quality level selection against a bitrate ceiling.

use crate::manifest::LogicalStream;

/// Index of the quality level `select_bitrate` would pick for `ceiling`, starting from
/// the stream's current selection.
///
/// A ceiling of 0 means unconstrained. When every level exceeds the ceiling the lowest
/// one is kept.
pub fn target_index(stream: &LogicalStream, ceiling: u64) -> usize {
    let qualities = stream.qualities();
    if qualities.is_empty() {
        return 0;
    }

    let ceiling = if ceiling == 0 { u64::MAX } else { ceiling };
    let mut index = stream.current_quality_index().min(qualities.len() - 1);

    while index > 0 && qualities[index].bitrate > ceiling {
        index -= 1;
    }
    while index + 1 < qualities.len() && qualities[index + 1].bitrate < ceiling {
        index += 1;
    }
    index
}

/// Moves the stream's quality cursor to the best level under `ceiling`.
/// Returns whether the selection changed.
pub fn select_bitrate(stream: &mut LogicalStream, ceiling: u64) -> bool {
    let target = target_index(stream, ceiling);
    if target == stream.current_quality {
        return false;
    }
    stream.current_quality = target;
    true
}

/// Ceiling for one stream given the configured connection speed and, in adaptive mode,
/// the measured download rate scaled by `bitrate_limit`.
///
/// Returns 0 (unconstrained) when neither source gives a value.
pub fn stream_ceiling(connection_speed: u64, bitrate_limit: f32, measured: Option<u64>, adaptive: bool) -> u64 {
    let measured = measured
        .filter(|_| adaptive)
        .map(|rate| ((rate as f64 * bitrate_limit as f64) as u64).max(1));

    match (connection_speed, measured) {
        (0, None) => 0,
        (0, Some(measured)) => measured,
        (speed, None) => speed,
        (speed, Some(measured)) => speed.min(measured),
    }
}
