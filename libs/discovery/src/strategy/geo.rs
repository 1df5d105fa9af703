//! Geo-aware selection
//!
//! Client coordinates come from the request itself or from a pluggable
//! [`GeoResolver`] keyed by client identity (typically an IP address).
//! Node coordinates come from the `lat` / `lon` metadata keys.

use dashmap::DashMap;
use std::fmt::Debug;

use super::basic::first_min_by;
use crate::model::GeoPoint;
use crate::registry::NodeSlot;

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Resolves a client key to coordinates
pub trait GeoResolver: Send + Sync + Debug {
    fn locate(&self, client_key: &str) -> Option<GeoPoint>;
}

/// In-memory client → location table
#[derive(Debug, Default)]
pub struct StaticGeoResolver {
    entries: DashMap<String, GeoPoint>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client_key: impl Into<String>, location: GeoPoint) {
        self.entries.insert(client_key.into(), location);
    }
}

impl GeoResolver for StaticGeoResolver {
    fn locate(&self, client_key: &str) -> Option<GeoPoint> {
        self.entries.get(client_key).map(|p| *p)
    }
}

/// Great-circle distance between two points
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Nearest node carrying coordinates; `None` when the client location is
/// unknown or no candidate has coordinates
pub fn nearest(candidates: &[&NodeSlot], origin: Option<GeoPoint>) -> Option<usize> {
    let origin = origin?;
    if candidates.iter().all(|s| s.node.location().is_none()) {
        return None;
    }
    first_min_by(candidates, |s| {
        s.node
            .location()
            .map_or(f64::INFINITY, |at| haversine_km(origin, at))
    })
}
