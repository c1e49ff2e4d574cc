//! Photovoltaic output from tilted-plane irradiance.

/// Instantaneous array output in kW for a given global tilted irradiance
/// (W/m²). Over a one-hour step this is also the kWh produced in that hour.
///
/// `output = round(gti * efficiency * system_size_kw / 1000, 2)`; negative
/// irradiance (sensor or model noise) is treated as darkness.
pub fn pv_output_kw(gti: f64, panel_efficiency: f64, system_size_kw: f64) -> f64 {
    let gti = gti.max(0.0);
    let out = round2(gti * panel_efficiency * system_size_kw / 1000.0);
    // -0.0 would otherwise leak into JSON as "-0.0"
    if out <= 0.0 {
        0.0
    } else {
        out
    }
}

/// Round half away from zero to two decimals.
pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================
