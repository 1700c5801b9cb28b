//! Normalized volume to device gain mapping

/// Quietest gain the output accepts, in millibels
pub const MIN_MILLIBELS: i32 = -6000;
/// Loudest gain the output accepts, in millibels
pub const MAX_MILLIBELS: i32 = 6000;
/// Gain change applied by one volume up/down step
pub const STEP_MILLIBELS: i32 = 300;

/// Map a volume in [0, 1] onto the device range, clamping out-of-range input
pub fn normalized_to_millibels(volume: f64) -> i32 {
    let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
    let span = (MAX_MILLIBELS - MIN_MILLIBELS) as f64;
    (MIN_MILLIBELS as f64 + volume * span).round() as i32
}

pub fn millibels_to_normalized(millibels: i32) -> f64 {
    let millibels = millibels.clamp(MIN_MILLIBELS, MAX_MILLIBELS);
    (millibels - MIN_MILLIBELS) as f64 / (MAX_MILLIBELS - MIN_MILLIBELS) as f64
}

/// Gain after moving `steps` volume steps (negative = quieter)
pub fn step_millibels(millibels: i32, steps: i32) -> i32 {
    (millibels + steps * STEP_MILLIBELS).clamp(MIN_MILLIBELS, MAX_MILLIBELS)
}
