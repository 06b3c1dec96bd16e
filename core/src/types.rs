//! Shared primitive types used across the pipeline.

/// External user identifier shared by both stores (advertising device id).
pub type UserId = String;

/// A/B group label as tagged on the device record.
pub type GroupId = String;

/// Campaign identifier in the conversion store.
pub type CampaignId = i64;

/// Timestamp format used when rendering timestamps into tables. Whole
/// seconds render without a fraction.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Round `value` to `places` decimal places (half away from zero).
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
