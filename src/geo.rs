//! Local tangent-plane projection and heading helpers.
//!
//! Race courses are short (a few km at most), so an equirectangular projection
//! around a session origin is accurate enough and keeps the filter math in
//! plain Euclidean meters. Axes: x = east, y = north.

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per second to knots.
pub const MS_TO_KNOTS: f64 = 1.943_844;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// Project a lat/lon point into the local meter frame around `origin`.
pub fn to_meters(point: LatLon, origin: LatLon) -> (f64, f64) {
    let x = (point.lon - origin.lon).to_radians() * origin.lat.to_radians().cos() * EARTH_RADIUS_M;
    let y = (point.lat - origin.lat).to_radians() * EARTH_RADIUS_M;
    (x, y)
}

/// Inverse of [`to_meters`].
pub fn from_meters(x: f64, y: f64, origin: LatLon) -> LatLon {
    let lat = origin.lat + (y / EARTH_RADIUS_M).to_degrees();
    let lon = origin.lon + (x / (EARTH_RADIUS_M * origin.lat.to_radians().cos())).to_degrees();
    LatLon { lat, lon }
}

/// Heading from an east/north velocity: atan2(east, north), so 0 = north and
/// +90 deg = east. Returns `None` when effectively stopped.
pub fn heading_from_velocity(vx: f64, vy: f64) -> Option<f64> {
    if !vx.is_finite() || !vy.is_finite() {
        return None;
    }
    let speed = vx.hypot(vy);
    if !speed.is_finite() || speed < 1e-6 {
        return None;
    }
    Some(vx.atan2(vy))
}

/// East/north velocity components from speed and heading (radians, 0 = north).
pub fn velocity_from_heading(speed: f64, heading_rad: f64) -> (f64, f64) {
    (speed * heading_rad.sin(), speed * heading_rad.cos())
}

/// Wrap an angle into (-pi, pi].
pub fn normalize_angle_rad(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let mut wrapped = angle % (2.0 * std::f64::consts::PI);
    if wrapped <= -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    if wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Wrap degrees into [0, 360).
pub fn normalize_heading_degrees(degrees: f64) -> f64 {
    let mut wrapped = degrees % 360.0;
    if wrapped < 0.0 {
        wrapped += 360.0;
    }
    wrapped
}

/// Signed smallest delta between two headings in degrees, in [-180, 180).
pub fn normalize_delta_degrees(delta: f64) -> f64 {
    ((delta + 540.0) % 360.0) - 180.0
}

/// Continue an unwrapped heading series: a 359 -> 1 step reads as +2, not -358.
/// Keeps wind-direction series continuous for trend fitting.
pub fn unwrap_heading_degrees(heading: f64, last: Option<(f64, f64)>) -> f64 {
    match last {
        Some((last_heading, last_unwrapped)) => {
            last_unwrapped + normalize_delta_degrees(heading - last_heading)
        }
        None => heading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_projection_round_trip() {
        let origin = LatLon { lat: 55.68, lon: 12.59 };
        let point = LatLon { lat: 55.6832, lon: 12.5951 };
        let (x, y) = to_meters(point, origin);
        let back = from_meters(x, y, origin);
        assert_relative_eq!(back.lat, point.lat, epsilon = 1e-9);
        assert_relative_eq!(back.lon, point.lon, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_convention() {
        // Due north.
        assert_relative_eq!(heading_from_velocity(0.0, 2.0).unwrap(), 0.0);
        // Due east.
        assert_relative_eq!(
            heading_from_velocity(2.0, 0.0).unwrap(),
            std::f64::consts::FRAC_PI_2
        );
        assert!(heading_from_velocity(0.0, 0.0).is_none());
    }

    #[test]
    fn test_unwrap_heading_continues_across_north() {
        let first = unwrap_heading_degrees(359.0, None);
        assert_relative_eq!(first, 359.0);
        let next = unwrap_heading_degrees(1.0, Some((359.0, first)));
        assert_relative_eq!(next, 361.0);
        let back = unwrap_heading_degrees(357.0, Some((1.0, next)));
        assert_relative_eq!(back, 357.0);
    }

    #[test]
    fn test_normalize_angle_rad_range() {
        let a = normalize_angle_rad(3.0 * std::f64::consts::PI);
        assert!(a > -std::f64::consts::PI && a <= std::f64::consts::PI);
        assert_relative_eq!(a, std::f64::consts::PI);
    }
}
