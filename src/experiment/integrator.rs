const SECONDS_PER_HOUR: f64 = 3600.0;

/// Running totals since the logger started.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntegratorState {
    pub energy_wh: f64,
    pub capacity_mah: f64,
}

/// Fold one cycle into the totals, returning the instantaneous power and the new state.
///
/// A non-finite power adds no energy and a non-finite current adds no capacity, so a
/// dropout leaves the totals where they were instead of turning them into NaN.
pub fn integrate(
    voltage: f64,
    current: f64,
    interval_s: f64,
    state: IntegratorState,
) -> (f64, IntegratorState) {
    let power = if voltage.is_finite() && current.is_finite() {
        voltage * current
    } else {
        f64::NAN
    };

    let energy_increment = if power.is_finite() {
        power * interval_s / SECONDS_PER_HOUR
    } else {
        0.0
    };

    let capacity_increment = if current.is_finite() {
        current * 1000.0 * interval_s / SECONDS_PER_HOUR
    } else {
        0.0
    };

    let next = IntegratorState {
        energy_wh: state.energy_wh + energy_increment,
        capacity_mah: state.capacity_mah + capacity_increment,
    };
    (power, next)
}
