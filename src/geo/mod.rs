use crate::models::driver::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Squared planar distance in degrees. Only meaningful for ordering, which
/// the square preserves.
pub fn squared_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let d_lat = a.lat - b.lat;
    let d_lng = a.lng - b.lng;
    d_lat * d_lat + d_lng * d_lng
}

#[cfg(test)]
mod tests {
    use super::{haversine_km, squared_distance};
    use crate::models::driver::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 50.9077,
            lng: 34.7981,
        };
        assert!(haversine_km(&p, &p) < 1e-9);
        assert_eq!(squared_distance(&p, &p), 0.0);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn squared_distance_orders_like_the_real_one() {
        let origin = GeoPoint {
            lat: 50.90,
            lng: 34.80,
        };
        let near = GeoPoint {
            lat: 50.91,
            lng: 34.81,
        };
        let far = GeoPoint {
            lat: 50.50,
            lng: 34.00,
        };
        assert!(squared_distance(&origin, &near) < squared_distance(&origin, &far));
        assert!(haversine_km(&origin, &near) < haversine_km(&origin, &far));
    }
}
