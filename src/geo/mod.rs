//! Geospatial index for race discovery.
//!
//! Pure functions only. Race-discovery queries filter a stored `geohash` field
//! with the 9-string output of [`neighbors`].

pub mod distance;
pub mod geohash;

pub use distance::{EARTH_RADIUS_KM, distance_km};
pub use geohash::{
    BoundingBox, CELL_WIDTH_KM, GeoError, GeoPoint, MAX_PRECISION, cell_dimensions, decode,
    decode_bbox, encode, neighbors, precision_for_radius,
};
