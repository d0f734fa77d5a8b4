//! Simulated meter value generation
//!
//! The generator is stateless: the energy register at time t is a pure
//! function of the transaction's starting meter value and elapsed time, so
//! reconnects and repeated sampling can never make it run backwards. Power
//! and current jitter around the nominal draw for realism.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::types::{Measurand, MeterValue, ReadingContext, SampledValue, UnitOfMeasure};

const INITIAL_SOC_PERCENT: f64 = 50.0;
const BATTERY_CAPACITY_WH: f64 = 60_000.0;
const AMBIENT_TEMPERATURE_C: f64 = 25.0;

/// Meter simulation parameters
#[derive(Debug, Clone)]
pub struct MeterConfig {
    /// Simulated charging power draw in watts
    pub nominal_power_w: f64,
    /// Simulated supply voltage
    pub nominal_voltage_v: f64,
    /// Bounded jitter applied to power/current, as a fraction of nominal
    pub fluctuation: f64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            nominal_power_w: 7400.0,
            nominal_voltage_v: 230.0,
            fluctuation: 0.05,
        }
    }
}

/// Stateless generator of simulated meter samples
#[derive(Debug, Clone)]
pub struct MeterGenerator {
    config: MeterConfig,
}

impl MeterGenerator {
    pub fn new(config: MeterConfig) -> Self {
        Self { config }
    }

    /// Energy register in Wh after `elapsed` of charging from `meter_start`.
    ///
    /// Deterministic and non-decreasing in `elapsed`.
    pub fn energy_wh(&self, meter_start: i64, elapsed: Duration) -> i64 {
        let drawn = self.config.nominal_power_w * elapsed.as_secs_f64() / 3600.0;
        meter_start + drawn as i64
    }

    /// Produce one MeterValue for the given measurands.
    ///
    /// Energy comes from the deterministic register; power, current and
    /// temperature jitter within the configured bound and are clamped
    /// non-negative.
    pub fn sample(
        &self,
        meter_start: i64,
        elapsed: Duration,
        measurands: &[Measurand],
        context: ReadingContext,
    ) -> MeterValue {
        let mut rng = rand::thread_rng();
        let power_w = self.jitter(&mut rng, self.config.nominal_power_w);

        let sampled_value = measurands
            .iter()
            .map(|&measurand| match measurand {
                Measurand::EnergyActiveImportRegister => SampledValue {
                    value: self.energy_wh(meter_start, elapsed).to_string(),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::Wh),
                },
                Measurand::PowerActiveImport => SampledValue {
                    value: format!("{:.0}", power_w),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::W),
                },
                Measurand::CurrentImport => SampledValue {
                    value: format!("{:.1}", power_w / self.config.nominal_voltage_v),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::A),
                },
                Measurand::Voltage => SampledValue {
                    value: format!("{:.1}", self.jitter(&mut rng, self.config.nominal_voltage_v)),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::V),
                },
                Measurand::SoC => SampledValue {
                    value: format!(
                        "{:.0}",
                        soc_percent((self.energy_wh(meter_start, elapsed) - meter_start) as f64)
                    ),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::Percent),
                },
                Measurand::Temperature => SampledValue {
                    value: format!(
                        "{:.1}",
                        self.jitter(&mut rng, AMBIENT_TEMPERATURE_C + 5.0)
                    ),
                    context: Some(context),
                    measurand: Some(measurand),
                    unit: Some(UnitOfMeasure::Celsius),
                },
            })
            .collect();

        MeterValue {
            timestamp: Utc::now(),
            sampled_value,
        }
    }

    fn jitter(&self, rng: &mut impl Rng, nominal: f64) -> f64 {
        let band = nominal * self.config.fluctuation;
        (nominal + rng.gen_range(-band..=band)).max(0.0)
    }
}

/// State of charge after drawing `drawn_wh` into the simulated battery.
fn soc_percent(drawn_wh: f64) -> f64 {
    let gained = drawn_wh / BATTERY_CAPACITY_WH * 100.0;
    (INITIAL_SOC_PERCENT + gained).min(100.0)
}

/// Parse the comma-separated `MeterValuesSampledData` configuration value.
///
/// Unrecognized measurand names are skipped.
pub fn parse_measurands(config_value: &str) -> Vec<Measurand> {
    config_value
        .split(',')
        .filter_map(|name| Measurand::from_wire_name(name.trim()))
        .collect()
}

/// Time elapsed since a transaction started, saturating at zero.
pub fn elapsed_since(start: DateTime<Utc>) -> Duration {
    (Utc::now() - start).to_std().unwrap_or(Duration::ZERO)
}
