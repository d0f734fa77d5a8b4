//! OCPP 1.6 configuration key registry
//!
//! Holds the key/value table served by GetConfiguration and mutated by
//! ChangeConfiguration. Keys marked readonly reject writes, keys marked
//! reboot-required accept the write but report RebootRequired.

use std::collections::BTreeMap;

use crate::types::{ConfigurationStatus, KeyValue};

/// One configuration key with its access flags
#[derive(Debug, Clone)]
pub struct ConfigurationEntry {
    pub key: String,
    pub readonly: bool,
    pub value: String,
    pub reboot_required: bool,
}

impl ConfigurationEntry {
    fn new(key: &str, readonly: bool, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            readonly,
            value: value.into(),
            reboot_required: false,
        }
    }
}

/// Registry of OCPP 1.6 configuration keys
///
/// Iteration order is the key's lexicographic order, so GetConfiguration
/// responses are stable across runs.
#[derive(Debug, Clone)]
pub struct ConfigurationRegistry {
    entries: BTreeMap<String, ConfigurationEntry>,
}

impl ConfigurationRegistry {
    /// Build the default OCPP 1.6 key table.
    ///
    /// `heartbeat_interval` seeds HeartbeatInterval, `number_of_connectors`
    /// seeds the readonly NumberOfConnectors key, `max_power_w` seeds the
    /// readonly MaxChargingPower key.
    pub fn new(heartbeat_interval: u64, number_of_connectors: u32, max_power_w: u32) -> Self {
        let defaults = [
            // Core profile
            ConfigurationEntry::new("AllowOfflineTxForUnknownId", false, "false"),
            ConfigurationEntry::new("AuthorizationCacheEnabled", false, "false"),
            ConfigurationEntry::new("AuthorizeRemoteTxRequests", false, "true"),
            ConfigurationEntry::new("BlinkRepeat", false, "3"),
            ConfigurationEntry::new("ClockAlignedDataInterval", false, "0"),
            ConfigurationEntry::new("ConnectionTimeOut", false, "120"),
            ConfigurationEntry::new("GetConfigurationMaxKeys", false, "100"),
            ConfigurationEntry::new("HeartbeatInterval", false, heartbeat_interval.to_string()),
            ConfigurationEntry::new("LightIntensity", false, "50"),
            ConfigurationEntry::new("LocalAuthorizeOffline", false, "true"),
            ConfigurationEntry::new("LocalPreAuthorize", false, "false"),
            ConfigurationEntry::new("MaxEnergyOnInvalidId", false, "0"),
            ConfigurationEntry::new(
                "MeterValuesAlignedData",
                false,
                "Energy.Active.Import.Register",
            ),
            ConfigurationEntry::new(
                "MeterValuesSampledData",
                false,
                "Energy.Active.Import.Register,Power.Active.Import",
            ),
            ConfigurationEntry::new("MeterValueSampleInterval", false, "60"),
            ConfigurationEntry::new("MinimumStatusDuration", false, "0"),
            ConfigurationEntry::new(
                "NumberOfConnectors",
                true,
                number_of_connectors.to_string(),
            ),
            ConfigurationEntry::new("ResetRetries", false, "3"),
            ConfigurationEntry::new("ConnectorPhaseRotation", false, "0.RST,1.RST"),
            ConfigurationEntry::new("StopTransactionOnEVSideDisconnect", false, "true"),
            ConfigurationEntry::new("StopTransactionOnInvalidId", false, "true"),
            ConfigurationEntry::new("StopTxnAlignedData", false, "Energy.Active.Import.Register"),
            ConfigurationEntry::new("StopTxnSampledData", false, "Energy.Active.Import.Register"),
            ConfigurationEntry::new(
                "SupportedFeatureProfiles",
                true,
                "Core,FirmwareManagement,LocalAuthListManagement,Reservation,SmartCharging,RemoteTrigger",
            ),
            ConfigurationEntry::new("TransactionMessageAttempts", false, "3"),
            ConfigurationEntry::new("TransactionMessageRetryInterval", false, "10"),
            ConfigurationEntry::new("UnlockConnectorOnEVSideDisconnect", false, "true"),
            ConfigurationEntry::new("WebSocketPingInterval", false, "0"),
            // Local auth list profile
            ConfigurationEntry::new("LocalAuthListEnabled", false, "false"),
            ConfigurationEntry::new("LocalAuthListMaxLength", true, "100"),
            ConfigurationEntry::new("SendLocalListMaxLength", true, "20"),
            // Reservation profile
            ConfigurationEntry::new("ReserveConnectorZeroSupported", true, "false"),
            // Smart charging profile
            ConfigurationEntry::new("ChargeProfileMaxStackLevel", true, "10"),
            ConfigurationEntry::new(
                "ChargingScheduleAllowedChargingRateUnit",
                true,
                "Current,Power",
            ),
            ConfigurationEntry::new("ChargingScheduleMaxPeriods", true, "6"),
            ConfigurationEntry::new("ConnectorSwitch3to1PhaseSupported", true, "false"),
            ConfigurationEntry::new("MaxChargingProfilesInstalled", true, "10"),
            // Vendor keys
            ConfigurationEntry::new("MaxChargingPower", true, max_power_w.to_string()),
        ];

        let entries = defaults
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();

        Self { entries }
    }

    /// Insert or replace entries from operator configuration.
    pub fn load_custom_entries(&mut self, custom: impl IntoIterator<Item = ConfigurationEntry>) {
        for entry in custom {
            self.entries.insert(entry.key.clone(), entry);
        }
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// Value parsed as integer, falling back to `default` when the key is
    /// absent or not numeric.
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Apply a ChangeConfiguration write.
    ///
    /// Unknown key is NotSupported, readonly key is Rejected, a value that
    /// fails the key's validator is Rejected. Writes to reboot-required keys
    /// are stored and reported as RebootRequired.
    pub fn update(&mut self, key: &str, value: &str) -> ConfigurationStatus {
        let Some(entry) = self.entries.get_mut(key) else {
            return ConfigurationStatus::NotSupported;
        };

        if entry.readonly {
            return ConfigurationStatus::Rejected;
        }

        if !Self::validate(key, value) {
            return ConfigurationStatus::Rejected;
        }

        entry.value = value.to_string();

        if entry.reboot_required {
            ConfigurationStatus::RebootRequired
        } else {
            ConfigurationStatus::Accepted
        }
    }

    // HeartbeatInterval must be a positive integer. The other interval keys
    // allow 0, which means "disabled".
    fn validate(key: &str, value: &str) -> bool {
        match key {
            "HeartbeatInterval" => matches!(value.parse::<i64>(), Ok(n) if n > 0),
            "MeterValueSampleInterval" | "WebSocketPingInterval" => {
                matches!(value.parse::<i64>(), Ok(n) if n >= 0)
            }
            _ => true,
        }
    }

    /// Build a GetConfiguration response body.
    ///
    /// With no filter, all keys are returned up to GetConfigurationMaxKeys;
    /// an empty filter list means the same as no filter. With a filter,
    /// known keys land in the first list and unknown names in the second.
    pub fn snapshot(&self, filter: Option<&[String]>) -> (Vec<KeyValue>, Vec<String>) {
        let max_keys = self.get_int("GetConfigurationMaxKeys", 100).max(0) as usize;

        match filter {
            None | Some([]) => {
                let known = self
                    .entries
                    .values()
                    .take(max_keys)
                    .map(Self::to_key_value)
                    .collect();
                (known, Vec::new())
            }
            Some(keys) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for key in keys {
                    match self.entries.get(key) {
                        Some(entry) if known.len() < max_keys => {
                            known.push(Self::to_key_value(entry))
                        }
                        Some(_) => {}
                        None => unknown.push(key.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }

    fn to_key_value(entry: &ConfigurationEntry) -> KeyValue {
        KeyValue {
            key: entry.key.clone(),
            readonly: entry.readonly,
            value: Some(entry.value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConfigurationRegistry {
        ConfigurationRegistry::new(60, 2, 22000)
    }

    #[test]
    fn test_defaults_seeded_from_station() {
        let reg = registry();
        assert_eq!(reg.get("HeartbeatInterval"), Some("60"));
        assert_eq!(reg.get("NumberOfConnectors"), Some("2"));
        assert_eq!(reg.get("MaxChargingPower"), Some("22000"));
        assert_eq!(reg.get_int("TransactionMessageAttempts", 0), 3);
    }

    #[test]
    fn test_update_readonly_rejected() {
        let mut reg = registry();
        assert_eq!(
            reg.update("NumberOfConnectors", "4"),
            ConfigurationStatus::Rejected
        );
        assert_eq!(reg.get("NumberOfConnectors"), Some("2"));
    }

    #[test]
    fn test_update_unknown_not_supported() {
        let mut reg = registry();
        assert_eq!(
            reg.update("NoSuchKey", "1"),
            ConfigurationStatus::NotSupported
        );
    }

    #[test]
    fn test_update_interval_validation() {
        let mut reg = registry();
        assert_eq!(
            reg.update("HeartbeatInterval", "-5"),
            ConfigurationStatus::Rejected
        );
        assert_eq!(
            reg.update("HeartbeatInterval", "abc"),
            ConfigurationStatus::Rejected
        );
        assert_eq!(reg.get("HeartbeatInterval"), Some("60"));

        assert_eq!(
            reg.update("HeartbeatInterval", "30"),
            ConfigurationStatus::Accepted
        );
        assert_eq!(reg.get_int("HeartbeatInterval", 0), 30);
    }

    #[test]
    fn test_snapshot_filter_splits_unknown() {
        let reg = registry();
        let filter = vec!["HeartbeatInterval".to_string(), "Bogus".to_string()];
        let (known, unknown) = reg.snapshot(Some(&filter));

        assert_eq!(known.len(), 1);
        assert_eq!(known[0].key, "HeartbeatInterval");
        assert!(!known[0].readonly);
        assert_eq!(unknown, vec!["Bogus".to_string()]);
    }

    #[test]
    fn test_snapshot_empty_filter_returns_all() {
        let reg = registry();
        let (all, _) = reg.snapshot(None);
        let (known, unknown) = reg.snapshot(Some(&[]));

        assert_eq!(known.len(), all.len());
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_snapshot_unfiltered_capped() {
        let mut reg = registry();
        assert_eq!(
            reg.update("GetConfigurationMaxKeys", "5"),
            ConfigurationStatus::Accepted
        );
        let (known, unknown) = reg.snapshot(None);
        assert_eq!(known.len(), 5);
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_reboot_required_key() {
        let mut reg = registry();
        reg.load_custom_entries([ConfigurationEntry {
            key: "AuthorizationKey".to_string(),
            readonly: false,
            value: String::new(),
            reboot_required: true,
        }]);

        assert_eq!(
            reg.update("AuthorizationKey", "secret"),
            ConfigurationStatus::RebootRequired
        );
        assert_eq!(reg.get("AuthorizationKey"), Some("secret"));
    }
}
