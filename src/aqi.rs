//! US EPA air quality index from pollutant concentrations.
//!
//! each pollutant maps to a sub-index by linear interpolation inside its
//! breakpoint band; the overall index is the worst sub-index.

use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy)]
struct Breakpoint {
    c_low: f64,
    c_high: f64,
    i_low: f64,
    i_high: f64,
}

const fn bp(c_low: f64, c_high: f64, i_low: f64, i_high: f64) -> Breakpoint {
    Breakpoint { c_low, c_high, i_low, i_high }
}

const PM25: [Breakpoint; 7] = [
    bp(0.0, 12.0, 0.0, 50.0),
    bp(12.1, 35.4, 51.0, 100.0),
    bp(35.5, 55.4, 101.0, 150.0),
    bp(55.5, 150.4, 151.0, 200.0),
    bp(150.5, 250.4, 201.0, 300.0),
    bp(250.5, 350.4, 301.0, 400.0),
    bp(350.5, 500.4, 401.0, 500.0),
];

const PM10: [Breakpoint; 7] = [
    bp(0.0, 54.0, 0.0, 50.0),
    bp(55.0, 154.0, 51.0, 100.0),
    bp(155.0, 254.0, 101.0, 150.0),
    bp(255.0, 354.0, 151.0, 200.0),
    bp(355.0, 424.0, 201.0, 300.0),
    bp(425.0, 504.0, 301.0, 400.0),
    bp(505.0, 604.0, 401.0, 500.0),
];

// ppm
const CO: [Breakpoint; 7] = [
    bp(0.0, 4.4, 0.0, 50.0),
    bp(4.5, 9.4, 51.0, 100.0),
    bp(9.5, 12.4, 101.0, 150.0),
    bp(12.5, 15.4, 151.0, 200.0),
    bp(15.5, 30.4, 201.0, 300.0),
    bp(30.5, 40.4, 301.0, 400.0),
    bp(40.5, 50.4, 401.0, 500.0),
];

// ppb
const SO2: [Breakpoint; 7] = [
    bp(0.0, 35.0, 0.0, 50.0),
    bp(36.0, 75.0, 51.0, 100.0),
    bp(76.0, 185.0, 101.0, 150.0),
    bp(186.0, 304.0, 151.0, 200.0),
    bp(305.0, 604.0, 201.0, 300.0),
    bp(605.0, 804.0, 301.0, 400.0),
    bp(805.0, 1004.0, 401.0, 500.0),
];

// ppb
const NO2: [Breakpoint; 7] = [
    bp(0.0, 53.0, 0.0, 50.0),
    bp(54.0, 100.0, 51.0, 100.0),
    bp(101.0, 360.0, 101.0, 150.0),
    bp(361.0, 649.0, 151.0, 200.0),
    bp(650.0, 1249.0, 201.0, 300.0),
    bp(1250.0, 1649.0, 301.0, 400.0),
    bp(1650.0, 2049.0, 401.0, 500.0),
];

// ppb, 8-hour, simplified
const O3: [Breakpoint; 5] = [
    bp(0.0, 54.0, 0.0, 50.0),
    bp(55.0, 70.0, 51.0, 100.0),
    bp(71.0, 85.0, 101.0, 150.0),
    bp(86.0, 105.0, 151.0, 200.0),
    bp(106.0, 200.0, 201.0, 300.0),
];

fn breakpoints(pollutant: &str) -> Option<&'static [Breakpoint]> {
    match pollutant {
        "pm25" => Some(&PM25),
        "pm10" => Some(&PM10),
        "co" => Some(&CO),
        "so2" => Some(&SO2),
        "no2" => Some(&NO2),
        "o3" => Some(&O3),
        _ => None,
    }
}

/// sub-index for one pollutant.
///
/// above the top band reads as 500; unknown pollutants, negative values and
/// the gaps between bands read as 0.
pub fn sub_index(concentration: f64, pollutant: &str) -> u16 {
    let Some(bands) = breakpoints(pollutant) else {
        return 0;
    };

    match bands
        .iter()
        .find(|b| concentration >= b.c_low && concentration <= b.c_high)
    {
        Some(b) => {
            let slope = (b.i_high - b.i_low) / (b.c_high - b.c_low);
            (slope * (concentration - b.c_low) + b.i_low).round() as u16
        }
        None => match bands.last() {
            Some(top) if concentration > top.c_high => 500,
            _ => 0,
        },
    }
}

/// overall index: worst sub-index over the six tracked pollutants,
/// missing pollutants count as zero concentration
pub fn air_quality_index(values: &BTreeMap<String, f64>) -> u16 {
    ["pm25", "pm10", "co", "so2", "no2", "o3"]
        .iter()
        .map(|p| sub_index(values.get(*p).copied().unwrap_or(0.0), p))
        .max()
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiBand {
    Good,
    Moderate,
    UnhealthyForSensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

impl AqiBand {
    pub fn classify(index: u16) -> Self {
        match index {
            0..=50 => Self::Good,
            51..=100 => Self::Moderate,
            101..=150 => Self::UnhealthyForSensitive,
            151..=200 => Self::Unhealthy,
            201..=300 => Self::VeryUnhealthy,
            _ => Self::Hazardous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_inside_band() {
        assert_eq!(sub_index(0.0, "pm25"), 0);
        assert_eq!(sub_index(12.0, "pm25"), 50);
        // (100-51)/(35.4-12.1) * (35.4-12.1) + 51
        assert_eq!(sub_index(35.4, "pm25"), 100);
        assert_eq!(sub_index(42.0, "pm25"), 117);
    }

    #[test]
    fn edges_and_unknowns() {
        assert_eq!(sub_index(900.0, "pm25"), 500);
        assert_eq!(sub_index(12.05, "pm25"), 0);
        assert_eq!(sub_index(10.0, "radon"), 0);
        assert_eq!(sub_index(-1.0, "co"), 0);
    }

    #[test]
    fn overall_index_is_worst_pollutant() {
        let values: BTreeMap<String, f64> = [
            ("pm25", 42.0),
            ("pm10", 60.0),
            ("co", 300.0),
            ("no2", 12.0),
            ("o3", 20.0),
            ("so2", 5.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        // co=300ppm is far above the top band
        assert_eq!(air_quality_index(&values), 500);
    }

    #[test]
    fn bands() {
        assert_eq!(AqiBand::classify(42), AqiBand::Good);
        assert_eq!(AqiBand::classify(117), AqiBand::UnhealthyForSensitive);
        assert_eq!(AqiBand::classify(500), AqiBand::Hazardous);
    }
}
