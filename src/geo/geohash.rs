//! Geohash encoding for proximity queries.
//!
//! A geohash is built by bisecting the longitude and latitude ranges in
//! alternation (longitude first), emitting one bit per bisection, and packing
//! each 5 bits into one character of the base-32 alphabet below. Nearby points
//! share cells, so a 9-cell neighborhood (center plus 8 compass neighbors)
//! approximates a radius query on backends that only support equality or
//! `in`-list filters.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest supported geohash.
pub const MAX_PRECISION: usize = 12;

/// Approximate cell size in km for geohash lengths 1 through 7, used to pick a
/// precision for a search radius.
pub const CELL_WIDTH_KM: [f64; 7] = [2500.0, 630.0, 78.0, 20.0, 2.4, 0.61, 0.076];

const BITS_PER_CHAR: usize = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeoError {
    #[error("coordinates out of range: lat {lat}, lon {lon}")]
    OutOfRange { lat: f64, lon: f64 },

    #[error("invalid geohash character {ch:?} at position {position}")]
    InvalidCharacter { ch: char, position: usize },

    #[error("geohash precision {0} is outside 1..={MAX_PRECISION}")]
    InvalidPrecision(usize),

    #[error("geohash is empty")]
    Empty,
}

/// Result type for geohash operations.
pub type Result<T> = std::result::Result<T, GeoError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// The area a geohash covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            lat: (self.min_lat + self.max_lat) / 2.0,
            lon: (self.min_lon + self.max_lon) / 2.0,
        }
    }

    pub fn contains(&self, p: GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&p.lat)
            && (self.min_lon..=self.max_lon).contains(&p.lon)
    }
}

fn check_precision(precision: usize) -> Result<()> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(GeoError::InvalidPrecision(precision));
    }
    Ok(())
}

/// Encodes a coordinate as a geohash of `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(GeoError::OutOfRange { lat, lon });
    }
    check_precision(precision)?;

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut index = 0usize;

    for bit in 0..precision * BITS_PER_CHAR {
        let (value, lo, hi) = if bit % 2 == 0 {
            (lon, &mut lon_lo, &mut lon_hi)
        } else {
            (lat, &mut lat_lo, &mut lat_hi)
        };
        let mid = (*lo + *hi) / 2.0;
        index <<= 1;
        if value >= mid {
            index |= 1;
            *lo = mid;
        } else {
            *hi = mid;
        }

        if bit % BITS_PER_CHAR == BITS_PER_CHAR - 1 {
            hash.push(ALPHABET[index] as char);
            index = 0;
        }
    }

    Ok(hash)
}

fn char_value(ch: char, position: usize) -> Result<usize> {
    u8::try_from(ch)
        .ok()
        .and_then(|b| ALPHABET.iter().position(|&a| a == b))
        .ok_or(GeoError::InvalidCharacter { ch, position })
}

/// Decodes a geohash to the cell it covers.
pub fn decode_bbox(hash: &str) -> Result<BoundingBox> {
    if hash.is_empty() {
        return Err(GeoError::Empty);
    }
    check_precision(hash.chars().count())?;

    let mut bbox = BoundingBox {
        min_lat: -90.0,
        max_lat: 90.0,
        min_lon: -180.0,
        max_lon: 180.0,
    };
    let mut even = true;

    for (position, ch) in hash.chars().enumerate() {
        let value = char_value(ch, position)?;
        for shift in (0..BITS_PER_CHAR).rev() {
            let bit = (value >> shift) & 1 == 1;
            let (lo, hi) = if even {
                (&mut bbox.min_lon, &mut bbox.max_lon)
            } else {
                (&mut bbox.min_lat, &mut bbox.max_lat)
            };
            let mid = (*lo + *hi) / 2.0;
            if bit {
                *lo = mid;
            } else {
                *hi = mid;
            }
            even = !even;
        }
    }

    Ok(bbox)
}

/// Decodes a geohash to the center of its cell.
pub fn decode(hash: &str) -> Result<GeoPoint> {
    decode_bbox(hash).map(|b| b.center())
}

/// Height and width of a cell in degrees, as `(lat_deg, lon_deg)`.
pub fn cell_dimensions(precision: usize) -> Result<(f64, f64)> {
    check_precision(precision)?;
    let bits = (precision * BITS_PER_CHAR) as i32;
    let lon_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    Ok((180.0 / 2f64.powi(lat_bits), 360.0 / 2f64.powi(lon_bits)))
}

/// Compass offsets in cell units as `(lat, lon)`: center, then N, NE, E, SE, S, SW, W, NW.
const NEIGHBORHOOD: [(f64, f64); 9] = [
    (0.0, 0.0),
    (1.0, 0.0),
    (1.0, 1.0),
    (0.0, 1.0),
    (-1.0, 1.0),
    (-1.0, 0.0),
    (-1.0, -1.0),
    (0.0, -1.0),
    (1.0, -1.0),
];

/// Returns `hash` followed by its 8 compass neighbors at the same precision.
///
/// Each neighbor is found by moving the cell center one cell in the target
/// direction, clamping to the valid coordinate range, and re-encoding. Near
/// the poles and the antimeridian clamping can map a neighbor back onto an
/// edge cell, so the result may contain repeats there.
pub fn neighbors(hash: &str) -> Result<Vec<String>> {
    let center = decode(hash)?;
    let precision = hash.chars().count();
    let (dlat, dlon) = cell_dimensions(precision)?;

    NEIGHBORHOOD
        .iter()
        .map(|&(dy, dx)| {
            let lat = (center.lat + dy * dlat).clamp(-90.0, 90.0);
            let lon = (center.lon + dx * dlon).clamp(-180.0, 180.0);
            encode(lat, lon, precision)
        })
        .collect()
}

/// Picks the geohash length whose cell size best covers `radius_km`.
///
/// Returns the longest precision whose cell is still at least as wide as the
/// radius, so the 9-cell neighborhood reaches the whole circle. Radii larger
/// than the coarsest cell map to 1.
pub fn precision_for_radius(radius_km: f64) -> usize {
    CELL_WIDTH_KM
        .iter()
        .rposition(|&width| width >= radius_km)
        .map(|i| i + 1)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::Config as ProptestConfig;
    use std::collections::HashSet;

    #[test]
    fn encodes_san_francisco() {
        assert_eq!(encode(37.7749, -122.4194, 5).unwrap(), "9q8yy");
    }

    #[test]
    fn neighbors_of_san_francisco_are_distinct() {
        let cells = neighbors("9q8yy").unwrap();
        assert_eq!(cells.len(), 9);
        assert_eq!(cells[0], "9q8yy");
        let distinct: HashSet<_> = cells.iter().collect();
        assert_eq!(distinct.len(), 9);
        for cell in &cells {
            assert_eq!(cell.len(), 5);
            assert!(decode(cell).is_ok());
        }
    }

    #[test]
    fn neighbors_are_adjacent() {
        let center = decode_bbox("9q8yy").unwrap();
        let cells = neighbors("9q8yy").unwrap();
        let north = decode_bbox(&cells[1]).unwrap();
        let east = decode_bbox(&cells[3]).unwrap();
        assert!((north.min_lat - center.max_lat).abs() < 1e-9);
        assert!((east.min_lon - center.max_lon).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(matches!(
            encode(90.5, 0.0, 5),
            Err(GeoError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(0.0, -180.1, 5),
            Err(GeoError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(f64::NAN, 0.0, 5),
            Err(GeoError::OutOfRange { .. })
        ));
    }

    #[test]
    fn accepts_range_boundaries() {
        assert!(encode(90.0, 180.0, 7).is_ok());
        assert!(encode(-90.0, -180.0, 7).is_ok());
    }

    #[test]
    fn rejects_invalid_characters() {
        assert_eq!(
            decode("9q8ya"),
            Err(GeoError::InvalidCharacter {
                ch: 'a',
                position: 4
            })
        );
        assert!(matches!(
            decode("9Q8yy"),
            Err(GeoError::InvalidCharacter { position: 1, .. })
        ));
        assert!(matches!(
            decode("9q8é"),
            Err(GeoError::InvalidCharacter { .. })
        ));
    }

    #[test]
    fn rejects_bad_precision() {
        assert_eq!(decode(""), Err(GeoError::Empty));
        assert_eq!(encode(0.0, 0.0, 0), Err(GeoError::InvalidPrecision(0)));
        assert_eq!(encode(0.0, 0.0, 13), Err(GeoError::InvalidPrecision(13)));
    }

    #[test]
    fn cell_dimensions_match_decoded_cells() {
        for precision in 1..=MAX_PRECISION {
            let hash = encode(12.34, 56.78, precision).unwrap();
            let bbox = decode_bbox(&hash).unwrap();
            let (dlat, dlon) = cell_dimensions(precision).unwrap();
            assert!((bbox.max_lat - bbox.min_lat - dlat).abs() < 1e-12);
            assert!((bbox.max_lon - bbox.min_lon - dlon).abs() < 1e-12);
        }
    }

    #[test]
    fn north_pole_neighbors_stay_valid() {
        let hash = encode(89.99, 0.0, 4).unwrap();
        let cells = neighbors(&hash).unwrap();
        assert_eq!(cells.len(), 9);
        assert!(cells.iter().all(|c| decode(c).is_ok()));
    }

    #[test]
    fn precision_for_radius_picks_covering_cell() {
        assert_eq!(precision_for_radius(5000.0), 1);
        assert_eq!(precision_for_radius(2500.0), 1);
        assert_eq!(precision_for_radius(100.0), 2);
        assert_eq!(precision_for_radius(50.0), 3);
        assert_eq!(precision_for_radius(5.0), 4);
        assert_eq!(precision_for_radius(1.0), 5);
        assert_eq!(precision_for_radius(0.5), 6);
        assert_eq!(precision_for_radius(0.05), 7);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1000))]

        #[test]
        fn decode_lies_within_half_cell(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            let hash = encode(lat, lon, 7).unwrap();
            let center = decode(&hash).unwrap();
            let (dlat, dlon) = cell_dimensions(7).unwrap();
            prop_assert!((center.lat - lat).abs() <= dlat / 2.0);
            prop_assert!((center.lon - lon).abs() <= dlon / 2.0);
            let point = GeoPoint { lat, lon };
            prop_assert!(decode_bbox(&hash).unwrap().contains(point));
        }

        #[test]
        fn encode_of_decode_is_identity(hash in "[0-9b-hjkmnp-z]{1,12}") {
            let center = decode(&hash).unwrap();
            prop_assert_eq!(encode(center.lat, center.lon, hash.len()).unwrap(), hash);
        }
    }
}
