//! Fixed-point geographic coordinates.
//!
//! A [`Location`] stores longitude and latitude as signed 32-bit integers in
//! units of 1e-7 degrees. This is the resolution of the OSM database; it
//! keeps coordinate math exact and a location at 8 bytes.

use std::fmt;

use crate::error::{Error, Result};

/// Scaling factor between degrees and the internal fixed-point units.
pub const COORDINATE_PRECISION: i32 = 10_000_000;

const UNDEFINED_COORDINATE: i32 = i32::MIN;

/// A geographic position with 1e-7 degree resolution.
///
/// The distinguished undefined location (both coordinates at `i32::MIN`) is
/// distinct from every real position and is what index lookups return for
/// absent ids. Ordering is lexicographic on (x, y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    x: i32,
    y: i32,
}

impl Default for Location {
    fn default() -> Self {
        Self::undefined()
    }
}

impl Location {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub const fn undefined() -> Self {
        Self {
            x: UNDEFINED_COORDINATE,
            y: UNDEFINED_COORDINATE,
        }
    }

    /// Builds a location from coordinates in degrees.
    ///
    /// Values are scaled by 1e7 and rounded to the nearest unit so that any
    /// coordinate with at most 7 fractional digits round-trips exactly.
    pub fn from_degrees(lon: f64, lat: f64) -> Result<Self> {
        if !(-180.0..=180.0).contains(&lon) {
            return Err(Error::InvalidLocation(format!(
                "longitude out of range: {lon}"
            )));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(Error::InvalidLocation(format!(
                "latitude out of range: {lat}"
            )));
        }
        Ok(Self {
            x: (lon * f64::from(COORDINATE_PRECISION)).round() as i32,
            y: (lat * f64::from(COORDINATE_PRECISION)).round() as i32,
        })
    }

    pub const fn x(&self) -> i32 {
        self.x
    }

    pub const fn y(&self) -> i32 {
        self.y
    }

    pub fn lon(&self) -> f64 {
        f64::from(self.x) / f64::from(COORDINATE_PRECISION)
    }

    pub fn lat(&self) -> f64 {
        f64::from(self.y) / f64::from(COORDINATE_PRECISION)
    }

    pub const fn is_undefined(&self) -> bool {
        self.x == UNDEFINED_COORDINATE && self.y == UNDEFINED_COORDINATE
    }

    pub const fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    /// True iff the location lies within the world bounds of +-180/+-90
    /// degrees. The undefined location is not valid.
    pub const fn valid(&self) -> bool {
        self.x >= -180 * COORDINATE_PRECISION
            && self.x <= 180 * COORDINATE_PRECISION
            && self.y >= -90 * COORDINATE_PRECISION
            && self.y <= 90 * COORDINATE_PRECISION
    }

    /// Decodes a textual coordinate at `data[*pos]` into the x component,
    /// advancing `pos` past the consumed bytes.
    pub fn set_lon_partial(&mut self, data: &[u8], pos: &mut usize) -> Result<()> {
        self.x = parse_coordinate(data, pos)?;
        Ok(())
    }

    /// Decodes a textual coordinate at `data[*pos]` into the y component,
    /// advancing `pos` past the consumed bytes.
    pub fn set_lat_partial(&mut self, data: &[u8], pos: &mut usize) -> Result<()> {
        self.y = parse_coordinate(data, pos)?;
        Ok(())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "(undefined)")
        } else {
            write!(f, "({},{})", self.lon(), self.lat())
        }
    }
}

/// Parses a fixed-point decimal number into 1e-7 degree units.
///
/// Accepts an optional minus sign, an optional integer part and an optional
/// fractional part. Only the first 7 fractional digits are significant;
/// further digits are consumed and ignored. Stops at the first byte that can
/// not be part of the number.
fn parse_coordinate(data: &[u8], pos: &mut usize) -> Result<i32> {
    let mut p = *pos;
    let mut negative = false;
    if data.get(p) == Some(&b'-') {
        negative = true;
        p += 1;
    }

    let mut value: i64 = 0;
    let mut any_digits = false;
    while let Some(d) = data.get(p).filter(|b| b.is_ascii_digit()) {
        value = value * 10 + i64::from(d - b'0');
        any_digits = true;
        p += 1;
        if value > i64::from(i32::MAX) {
            return Err(Error::InvalidLocation("coordinate value too large".into()));
        }
    }

    let mut scale = 7;
    if data.get(p) == Some(&b'.') {
        p += 1;
        while let Some(d) = data.get(p).filter(|b| b.is_ascii_digit()) {
            if scale == 0 {
                // too many digits, ignore the rest
                p += 1;
                continue;
            }
            value = value * 10 + i64::from(d - b'0');
            scale -= 1;
            any_digits = true;
            p += 1;
        }
    }

    if !any_digits {
        return Err(Error::InvalidLocation("wrong format for coordinate".into()));
    }

    for _ in 0..scale {
        value *= 10;
    }
    if negative {
        value = -value;
    }
    if value > i64::from(i32::MAX) || value < -i64::from(i32::MAX) {
        return Err(Error::InvalidLocation("coordinate value too large".into()));
    }

    *pos = p;
    Ok(value as i32)
}

/// An axis-aligned box spanned by two locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    bottom_left: Location,
    top_right: Location,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            bottom_left: Location::undefined(),
            top_right: Location::undefined(),
        }
    }
}

impl Bounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_corners(bottom_left: Location, top_right: Location) -> Self {
        Self {
            bottom_left,
            top_right,
        }
    }

    /// Grows the box to contain `location`. Undefined locations are ignored.
    pub fn extend(&mut self, location: Location) {
        if location.is_undefined() {
            return;
        }
        if self.bottom_left.is_undefined() {
            self.bottom_left = location;
            self.top_right = location;
        } else {
            self.bottom_left = Location::new(
                self.bottom_left.x().min(location.x()),
                self.bottom_left.y().min(location.y()),
            );
            self.top_right = Location::new(
                self.top_right.x().max(location.x()),
                self.top_right.y().max(location.y()),
            );
        }
    }

    pub fn is_set(&self) -> bool {
        self.bottom_left.is_defined()
    }

    pub fn bottom_left(&self) -> Location {
        self.bottom_left
    }

    pub fn top_right(&self) -> Location {
        self.top_right
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn undefined_is_not_valid() {
        let loc = Location::undefined();
        assert!(loc.is_undefined());
        assert!(!loc.valid());
        assert_eq!(loc, Location::default());
    }

    #[test]
    fn from_degrees_scales_and_rounds() {
        let loc = Location::from_degrees(1.0, 2.0).unwrap();
        assert_eq!((loc.x(), loc.y()), (10_000_000, 20_000_000));

        // 2.3 * 1e7 is 22999999.999... in binary; rounding must recover it
        let loc = Location::from_degrees(2.3, -7.2).unwrap();
        assert_eq!((loc.x(), loc.y()), (23_000_000, -72_000_000));
    }

    #[test]
    fn from_degrees_rejects_out_of_range() {
        assert!(matches!(
            Location::from_degrees(180.0001, 0.0),
            Err(Error::InvalidLocation(_))
        ));
        assert!(matches!(
            Location::from_degrees(0.0, -90.5),
            Err(Error::InvalidLocation(_))
        ));
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(Location::new(1, 5) < Location::new(2, 0));
        assert!(Location::new(1, 1) < Location::new(1, 2));
    }

    fn coord(s: &str) -> Result<(i32, usize)> {
        let mut pos = 0;
        let v = parse_coordinate(s.as_bytes(), &mut pos)?;
        Ok((v, pos))
    }

    #[test]
    fn parse_coordinate_variants() {
        assert_eq!(coord("1").unwrap(), (10_000_000, 1));
        assert_eq!(coord("1.0").unwrap(), (10_000_000, 3));
        assert_eq!(coord("-3.14").unwrap(), (-31_400_000, 5));
        assert_eq!(coord(".5").unwrap(), (5_000_000, 2));
        assert_eq!(coord("1.1234567").unwrap(), (11_234_567, 9));
        // the 8th and following fractional digits are consumed but ignored
        assert_eq!(coord("1.123456789").unwrap(), (11_234_567, 11));
        // stops at the first non-numeric byte
        assert_eq!(coord("2.5y1").unwrap(), (25_000_000, 3));
    }

    #[test]
    fn parse_coordinate_rejects_garbage() {
        assert!(coord("x").is_err());
        assert!(coord("-").is_err());
        assert!(coord("").is_err());
        assert!(coord("999999999999").is_err());
    }

    #[test]
    fn bounds_extend() {
        let mut bounds = Bounds::new();
        assert!(!bounds.is_set());
        bounds.extend(Location::new(10, 20));
        bounds.extend(Location::new(-5, 30));
        bounds.extend(Location::undefined());
        assert_eq!(bounds.bottom_left(), Location::new(-5, 20));
        assert_eq!(bounds.top_right(), Location::new(10, 30));
    }

    proptest! {
        #[test]
        fn roundtrip_through_degrees(
            x in -1_800_000_000i32..=1_800_000_000,
            y in -900_000_000i32..=900_000_000,
        ) {
            let lon = f64::from(x) / f64::from(COORDINATE_PRECISION);
            let lat = f64::from(y) / f64::from(COORDINATE_PRECISION);
            let loc = Location::from_degrees(lon, lat).unwrap();
            prop_assert_eq!(loc.x(), x);
            prop_assert_eq!(loc.y(), y);
        }
    }
}
