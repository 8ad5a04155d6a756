//! Quantities computed by consumers from one or more cached registers.

use crate::payload::record::{Measurement, ResultsCache};
use crate::payload::registers::REGISTER_HEAT_ENERGY;

/// Reports the heat energy register of a 403 as a gas volume in m³, for
/// energy dashboards that only accept gas meters.
///
/// Returns `None` until the heat energy register has been read.
pub fn heat_energy_to_gas(cache: &ResultsCache) -> Option<Measurement> {
    cache.get(REGISTER_HEAT_ENERGY).map(|energy| Measurement {
        key: energy.key,
        value: energy.value,
        unit: Some("m³"),
    })
}
