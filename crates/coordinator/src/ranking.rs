//! 地理距离过滤与排序
//!
//! 纯函数，无副作用。距离一律按全精度参与过滤与排序，
//! 仅在对外上报时保留两位小数。

use dispatch_domain::entities::{DriverCandidate, Location};

/// 地球平均半径（公里）
const EARTH_RADIUS_KM: f64 = 6371.0;

/// 两点间大圆距离（haversine），单位公里
pub fn haversine_km(a: Location, b: Location) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// 按半径过滤并按距离升序排序候选司机
///
/// 每个保留的候选都会写入到上车点的全精度距离；
/// 距离相同时按 driver_id 作为稳定次序键，保证排序可重复。
pub fn rank_within_radius(
    reference: Location,
    candidates: Vec<DriverCandidate>,
    radius_km: f64,
) -> Vec<DriverCandidate> {
    let mut ranked: Vec<DriverCandidate> = candidates
        .into_iter()
        .map(|mut candidate| {
            candidate.distance_km = haversine_km(reference, candidate.location);
            candidate
        })
        .filter(|candidate| candidate.distance_km <= radius_km)
        .collect();

    sort_by_distance(&mut ranked);
    ranked
}

/// (distance, driver_id) 复合键排序
pub fn sort_by_distance(candidates: &mut [DriverCandidate]) {
    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.driver_id.cmp(&b.driver_id))
    });
}
