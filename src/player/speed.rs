//! Playback speed steps

pub const NORMAL_SPEED: i32 = 1;
pub const MAX_SPEED: i32 = 8;

/// Rates reachable through increase/decrease, slowest reverse first
pub const SPEED_LADDER: [i32; 8] = [-8, -4, -2, -1, 1, 2, 4, 8];

pub fn is_valid(rate: i32) -> bool {
    rate != 0 && rate.abs() <= MAX_SPEED
}

/// Next rung up the ladder, staying on the top one
pub fn faster(rate: i32) -> i32 {
    SPEED_LADDER
        .iter()
        .copied()
        .find(|&r| r > rate)
        .unwrap_or(MAX_SPEED)
}

/// Next rung down the ladder, staying on the bottom one
pub fn slower(rate: i32) -> i32 {
    SPEED_LADDER
        .iter()
        .rev()
        .copied()
        .find(|&r| r < rate)
        .unwrap_or(-MAX_SPEED)
}

/// From normal or reverse playback jump straight to 2x, otherwise speed up
pub fn fast_forward(rate: i32) -> i32 {
    if rate <= NORMAL_SPEED { 2 } else { faster(rate) }
}

/// From forward playback jump straight to -2x, otherwise rewind faster
pub fn rewind(rate: i32) -> i32 {
    if rate > -2 { -2 } else { slower(rate) }
}
