//! KMP Unit Table and Lookup Functions
//!
//! Maps the unit byte of a KMP register response onto a display unit and a
//! decimal scale exponent. Codes 55-57 carry an implicit factor of ten.

/// Display label of a physical unit.
pub type UnitLabel = &'static str;

/// KMP unit codes (0–64): (code, label, scale exponent).
///
/// A `None` label marks a dimensionless value.
pub const UNIT_CODES: &[(u8, Option<UnitLabel>, i8)] = &[
    (0, None, 0),
    (1, Some("Wh"), 0),
    (2, Some("kWh"), 0),
    (3, Some("MWh"), 0),
    (4, Some("GWh"), 0),
    (5, Some("J"), 0),
    (6, Some("kJ"), 0),
    (7, Some("MJ"), 0),
    (8, Some("GJ"), 0),
    (9, Some("Cal"), 0),
    (10, Some("kCal"), 0),
    (11, Some("Mcal"), 0),
    (12, Some("Gcal"), 0),
    (13, Some("varh"), 0),
    (14, Some("kvarh"), 0),
    (15, Some("Mvarh"), 0),
    (16, Some("Gvarh"), 0),
    (17, Some("VAh"), 0),
    (18, Some("kVAh"), 0),
    (19, Some("MVAh"), 0),
    (20, Some("GVAh"), 0),
    (21, Some("kW"), 0),
    (22, Some("kW"), 0),
    (23, Some("MW"), 0),
    (24, Some("GW"), 0),
    (25, Some("kvar"), 0),
    (26, Some("kvar"), 0),
    (27, Some("Mvar"), 0),
    (28, Some("Gvar"), 0),
    (29, Some("VA"), 0),
    (30, Some("kVA"), 0),
    (31, Some("MVA"), 0),
    (32, Some("GVA"), 0),
    (33, Some("V"), 0),
    (34, Some("A"), 0),
    (35, Some("kV"), 0),
    (36, Some("kA"), 0),
    (37, Some("°C"), 0),
    (38, Some("K"), 0),
    (39, Some("l"), 0),
    (40, Some("m³"), 0),
    (41, Some("l/h"), 0),
    (42, Some("m³/h"), 0),
    (43, Some("m³×°C"), 0),
    (44, Some("ton"), 0),
    (45, Some("ton/h"), 0),
    (46, Some("h"), 0),
    (47, Some("hh:mm:ss"), 0),
    (48, Some("yy:mm:dd"), 0),
    (49, Some("yyyy:mm:dd"), 0),
    (50, Some("mm:dd"), 0),
    (51, None, 0),
    (52, Some("bar"), 0),
    (53, Some("RTC"), 0),
    (54, Some("ASCII"), 0),
    (55, Some("m³"), 1),
    (56, Some("ton"), 1),
    (57, Some("GJ"), 1),
    (58, Some("min"), 0),
    (59, Some("bitfield"), 0),
    (60, Some("s"), 0),
    (61, Some("ms"), 0),
    (62, Some("days"), 0),
    (63, Some("RTC-Q"), 0),
    (64, Some("datetime"), 0),
];

/// Unit code of a packed `yymmdd` date.
pub const UNIT_CODE_PACKED_DATE: u8 = 48;

fn lookup(code: u8) -> Option<&'static (u8, Option<UnitLabel>, i8)> {
    // The table is indexed by code
    UNIT_CODES.get(usize::from(code)).filter(|entry| entry.0 == code)
}

/// Returns the display unit and scale exponent of a unit code.
///
/// Unknown codes resolve to `(None, 0)` so the raw value is still usable.
pub fn unit_info(code: u8) -> (Option<UnitLabel>, i8) {
    lookup(code).map_or((None, 0), |&(_, label, scale)| (label, scale))
}

/// Returns `true` if the code is part of the documented enumeration.
pub fn is_known_unit(code: u8) -> bool {
    lookup(code).is_some()
}

/// Returns `true` if values with this unit are packed `yymmdd` dates.
pub fn is_packed_date_unit(code: u8) -> bool {
    code == UNIT_CODE_PACKED_DATE
}
