const HEIGHTS_CM: [f64; 5] = [80.0, 90.0, 100.0, 110.0, 120.0];
const PIXELS_PER_CM: [f64; 5] = [14.08, 11.91, 10.02, 9.31, 7.12];

/// Heights the camera scale was measured at.
pub(crate) const CALIBRATED_HEIGHT_CM: (u32, u32) = (80, 120);

/// Pixels per centimetre on the ground plane seen from `height_cm`.
///
/// Measured for the downward camera between 80 cm and 120 cm. Outside that
/// band the nearest segment is extended, which reaches zero a little above
/// 150 cm.
pub fn pixels_per_cm(height_cm: f64) -> f64 {
    let last = HEIGHTS_CM.len() - 1;
    let segment = HEIGHTS_CM
        .windows(2)
        .position(|w| height_cm < w[1])
        .unwrap_or(last - 1);

    let (h0, h1) = (HEIGHTS_CM[segment], HEIGHTS_CM[segment + 1]);
    let (p0, p1) = (PIXELS_PER_CM[segment], PIXELS_PER_CM[segment + 1]);
    p0 + (height_cm - h0) * (p1 - p0) / (h1 - h0)
}
