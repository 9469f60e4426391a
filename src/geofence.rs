//! Store geofencing.
//!
//! A purchase is only accepted when the reporting device is within the
//! configured radius of a known store. Distances are great-circle distances
//! computed with the haversine formula.

use std::cmp::Ordering;

use serde::Serialize;

use crate::error::LedgerError;
use crate::types::{Coordinates, StoreLocation};

/// Mean Earth radius, in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// The store a reported location was matched to.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GeofenceMatch {
    /// The ID of the matched store.
    pub store_id: String,
    /// The distance from the store center, in meters.
    pub distance_meters: f64,
}

/// Great-circle distance between two points, in meters.
pub fn haversine_distance(a: Coordinates, b: Coordinates) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    // Rounding can push h marginally above 1 for antipodal points.
    let c = 2.0 * h.sqrt().min(1.0).asin();

    EARTH_RADIUS_METERS * c
}

/// The stores deployed with the program.
pub fn default_store_locations() -> Vec<StoreLocation> {
    vec![
        StoreLocation {
            id: "store1".to_string(),
            name: "Loja 1".to_string(),
            address: "Rua Dois, 2130a - Residencial 1 - Cágado".to_string(),
            latitude: -3.859981833155958,
            longitude: -38.63311136233465,
            radius: 40.0,
        },
        StoreLocation {
            id: "store2".to_string(),
            name: "Loja 2".to_string(),
            address: "Rua Um, 1614c - Residencial 1 - Cágado".to_string(),
            latitude: -3.8631365069746244,
            longitude: -38.63175101815522,
            radius: 40.0,
        },
    ]
}

/// Validates reported coordinates against a fixed set of stores.
#[derive(Debug, Clone)]
pub struct GeofenceValidator {
    stores: Vec<StoreLocation>,
}

impl GeofenceValidator {
    pub fn new(stores: Vec<StoreLocation>) -> Self {
        Self { stores }
    }

    pub fn stores(&self) -> &[StoreLocation] {
        &self.stores
    }

    /// Returns the nearest store whose radius contains `location`.
    ///
    /// Ties on distance go to the lexicographically lowest store id.
    pub fn validate(&self, location: Option<Coordinates>) -> Result<GeofenceMatch, LedgerError> {
        let point = location.ok_or(LedgerError::InvalidLocation)?;
        if !is_valid(point) {
            return Err(LedgerError::InvalidLocation);
        }

        self.stores
            .iter()
            .map(|store| {
                let center = Coordinates::new(store.latitude, store.longitude);
                (store, haversine_distance(point, center))
            })
            .filter(|(store, distance)| *distance <= store.radius)
            .min_by(|(a, da), (b, db)| {
                da.partial_cmp(db)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(store, distance)| GeofenceMatch {
                store_id: store.id.clone(),
                distance_meters: distance,
            })
            .ok_or(LedgerError::OutOfRange)
    }
}

impl Default for GeofenceValidator {
    fn default() -> Self {
        Self::new(default_store_locations())
    }
}

fn is_valid(point: Coordinates) -> bool {
    point.latitude.is_finite()
        && point.longitude.is_finite()
        && (-90.0..=90.0).contains(&point.latitude)
        && (-180.0..=180.0).contains(&point.longitude)
}
