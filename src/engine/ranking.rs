use std::cmp::Ordering;
use std::collections::HashSet;

use crate::geo::squared_distance;
use crate::models::driver::{Driver, DriverId, GeoPoint};

/// Orders the dispatchable drivers for an offer chain, nearest first.
///
/// `drivers` is expected in directory order. Drivers without a known position
/// go last and keep that order among themselves, as does everyone when the
/// order has no coordinates. An empty result means there is no supply.
pub fn rank(
    point: Option<GeoPoint>,
    exclude: &HashSet<DriverId>,
    drivers: &[Driver],
) -> Vec<DriverId> {
    let mut eligible: Vec<(&Driver, Option<f64>)> = drivers
        .iter()
        .filter(|driver| driver.is_dispatchable() && !exclude.contains(&driver.id))
        .map(|driver| {
            let distance = point
                .zip(driver.position)
                .map(|(origin, position)| squared_distance(&origin, &position));
            (driver, distance)
        })
        .collect();

    if point.is_some() {
        // sort_by is stable, so ties and unpositioned drivers keep directory order
        eligible.sort_by(|a, b| compare_distance(a.1, b.1));
    }

    eligible.into_iter().map(|(driver, _)| driver.id).collect()
}

fn compare_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
