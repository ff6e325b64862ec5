use crate::models::order::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;
const AVERAGE_ROAD_SPEED_KMH: f64 = 30.0;
const KM_PER_MILE: f64 = 1.609;

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

/// Travel time at the assumed average road speed. The raw minutes are rounded
/// to one decimal first and only then to the nearest whole minute.
pub fn estimate_travel_minutes(from: &GeoPoint, to: &GeoPoint) -> i64 {
    let minutes = haversine_km(from, to) / AVERAGE_ROAD_SPEED_KMH * 60.0;
    round_one_decimal(minutes).round() as i64
}

/// Display-only distance, rounded to one decimal.
pub fn estimate_distance_miles(from: &GeoPoint, to: &GeoPoint) -> f64 {
    round_one_decimal(haversine_km(from, to) / KM_PER_MILE)
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::{estimate_distance_miles, estimate_travel_minutes, haversine_km};
    use crate::models::order::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
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
    fn same_point_takes_zero_minutes() {
        let p = GeoPoint {
            lat: 42.0,
            lng: -71.0,
        };
        assert_eq!(estimate_travel_minutes(&p, &p), 0);
    }

    #[test]
    fn thirty_km_takes_an_hour() {
        let a = GeoPoint { lat: 0.0, lng: 10.0 };
        let b = GeoPoint {
            lat: 0.2698,
            lng: 10.0,
        };
        assert!((haversine_km(&a, &b) - 30.0).abs() < 0.05);
        assert_eq!(estimate_travel_minutes(&a, &b), 60);
    }

    #[test]
    fn miles_are_rounded_to_one_decimal() {
        let a = GeoPoint { lat: 0.0, lng: 10.0 };
        let b = GeoPoint {
            lat: 0.2698,
            lng: 10.0,
        };
        // 30.0 km / 1.609 = 18.64..
        assert_eq!(estimate_distance_miles(&a, &b), 18.6);
    }
}
