//! Access-group parsing.
//!
//! End users grant the integrator a two-character access-group code per
//! device. The second character decides whether the integrator may send
//! commands (`'1'`) or only observe (anything else).

/// Returns `true` when the access-group code grants control.
///
/// Malformed or short codes are read-only.
pub fn can_control(access_groups: &str) -> bool {
    access_groups.as_bytes().get(1) == Some(&b'1')
}
