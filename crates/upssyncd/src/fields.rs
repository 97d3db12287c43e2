//! Catalogue of known apcupsd status fields
//!
//! Maps protocol field names to the identifiers published under a UPS
//! namespace. Fields missing from the table get a synthesized definition
//! whose identifier is the lower-cased field name. Catalogue identifiers
//! are always dotted, so a synthesized one can never shadow them.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value type advertised in object metadata
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    String,
    Boolean,
    /// Fallback for fields we know nothing about
    Mixed,
}

/// Published description of one status field
#[derive(Clone, Debug, PartialEq)]
pub struct FieldDefinition {
    /// Protocol field name (e.g. `LINEV`)
    pub ups_field_name: String,
    /// Identifier below the target namespace (e.g. `input.voltage`)
    pub published_id: String,
    pub display_name: String,
    pub value_type: ValueType,
    pub role: String,
    pub unit: Option<String>,
}

impl FieldDefinition {
    /// Definition for a field absent from the catalogue
    pub fn synthesize(ups_field_name: &str) -> Self {
        Self {
            ups_field_name: ups_field_name.to_string(),
            published_id: ups_field_name.to_ascii_lowercase(),
            display_name: ups_field_name.to_string(),
            value_type: ValueType::Mixed,
            role: "state".to_string(),
            unit: None,
        }
    }

    /// Whether this entry came from the static catalogue
    pub fn is_known(&self) -> bool {
        CATALOGUE.contains_key(self.ups_field_name.as_str())
    }
}

type Entry = (
    &'static str,
    &'static str,
    &'static str,
    ValueType,
    &'static str,
    Option<&'static str>,
);

#[rustfmt::skip]
const KNOWN_FIELDS: &[Entry] = &[
    ("UPSNAME",   "device.name",             "UPS name",                          ValueType::String, "info.name",        None),
    ("MODEL",     "device.model",            "Model",                             ValueType::String, "info.name",        None),
    ("SERIALNO",  "device.serial",           "Serial number",                     ValueType::String, "info.serial",      None),
    ("FIRMWARE",  "device.firmware",         "Firmware revision",                 ValueType::String, "info.firmware",    None),
    ("HOSTNAME",  "daemon.hostname",         "apcupsd host",                      ValueType::String, "info.name",        None),
    ("VERSION",   "daemon.version",          "apcupsd version",                   ValueType::String, "info.firmware",    None),
    ("CABLE",     "daemon.cable",            "Cable type",                        ValueType::String, "text",             None),
    ("DRIVER",    "daemon.driver",           "Driver",                            ValueType::String, "text",             None),
    ("UPSMODE",   "daemon.mode",             "UPS mode",                          ValueType::String, "text",             None),
    ("DATE",      "daemon.date",             "Last status update",                ValueType::String, "date",             None),
    ("STARTTIME", "daemon.start_time",       "apcupsd start time",                ValueType::String, "date",             None),
    ("STATUS",    "ups.status",              "UPS status",                        ValueType::String, "info.status",      None),
    ("LINEV",     "input.voltage",           "Input line voltage",                ValueType::Number, "value.voltage",    Some("V")),
    ("LINEFREQ",  "input.frequency",         "Input line frequency",              ValueType::Number, "value.frequency",  Some("Hz")),
    ("LOTRANS",   "input.transfer.low",      "Low transfer voltage",              ValueType::Number, "value.voltage",    Some("V")),
    ("HITRANS",   "input.transfer.high",     "High transfer voltage",             ValueType::Number, "value.voltage",    Some("V")),
    ("LASTXFER",  "input.transfer.reason",   "Reason for last transfer",          ValueType::String, "text",             None),
    ("SENSE",     "input.sensitivity",       "Input sensitivity",                 ValueType::String, "text",             None),
    ("OUTPUTV",   "output.voltage",          "Output voltage",                    ValueType::Number, "value.voltage",    Some("V")),
    ("NOMINV",    "input.voltage.nominal",   "Nominal input voltage",             ValueType::Number, "value.voltage",    Some("V")),
    ("NOMPOWER",  "ups.power.nominal",       "Nominal power",                     ValueType::Number, "value.power",      Some("W")),
    ("LOADPCT",   "ups.load",                "Load",                              ValueType::Number, "value",            Some("%")),
    ("ITEMP",     "ups.temperature",         "Internal temperature",              ValueType::Number, "value.temperature", Some("°C")),
    ("BCHARGE",   "battery.charge",          "Battery charge",                    ValueType::Number, "value.battery",    Some("%")),
    ("TIMELEFT",  "battery.runtime",         "Remaining runtime",                 ValueType::Number, "value",            Some("min")),
    ("BATTV",     "battery.voltage",         "Battery voltage",                   ValueType::Number, "value.voltage",    Some("V")),
    ("NOMBATTV",  "battery.voltage.nominal", "Nominal battery voltage",           ValueType::Number, "value.voltage",    Some("V")),
    ("BATTDATE",  "battery.date",            "Battery date",                      ValueType::String, "date",             None),
    ("MBATTCHG",  "shutdown.charge_min",     "Shutdown at battery charge",        ValueType::Number, "value",            Some("%")),
    ("MINTIMEL",  "shutdown.runtime_min",    "Shutdown at remaining runtime",     ValueType::Number, "value",            Some("min")),
    ("MAXTIME",   "shutdown.on_battery_max", "Shutdown after time on battery",    ValueType::Number, "value",            Some("s")),
    ("NUMXFERS",  "transfer.count",          "Transfers to battery",              ValueType::Number, "value",            None),
    ("TONBATT",   "transfer.on_battery",     "Time on battery",                   ValueType::Number, "value",            Some("s")),
    ("CUMONBATT", "transfer.on_battery_total", "Cumulative time on battery",      ValueType::Number, "value",            Some("s")),
    ("XONBATT",   "transfer.last_on_battery", "Last transfer to battery",         ValueType::String, "date",             None),
    ("XOFFBATT",  "transfer.last_off_battery", "Last transfer off battery",       ValueType::String, "date",             None),
    ("SELFTEST",  "selftest.result",         "Last self test result",             ValueType::String, "text",             None),
    ("LASTSTEST", "selftest.date",           "Last self test",                    ValueType::String, "date",             None),
];

static CATALOGUE: Lazy<HashMap<&'static str, FieldDefinition>> = Lazy::new(|| {
    KNOWN_FIELDS
        .iter()
        .map(|(name, id, display, value_type, role, unit)| {
            (
                *name,
                FieldDefinition {
                    ups_field_name: name.to_string(),
                    published_id: id.to_string(),
                    display_name: display.to_string(),
                    value_type: *value_type,
                    role: role.to_string(),
                    unit: unit.map(str::to_string),
                },
            )
        })
        .collect()
});

/// Catalogue entry for a protocol field, if any
pub fn lookup(ups_field_name: &str) -> Option<&'static FieldDefinition> {
    CATALOGUE.get(ups_field_name)
}

/// Catalogue entry, or a synthesized fallback
pub fn resolve(ups_field_name: &str) -> FieldDefinition {
    lookup(ups_field_name)
        .cloned()
        .unwrap_or_else(|| FieldDefinition::synthesize(ups_field_name))
}

/// Number of catalogue entries
pub fn known_count() -> usize {
    CATALOGUE.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_known_field_lookup() {
        let def = resolve("LINEV");
        assert_eq!(def.published_id, "input.voltage");
        assert_eq!(def.value_type, ValueType::Number);
        assert_eq!(def.unit.as_deref(), Some("V"));
        assert!(def.is_known());
    }

    #[test]
    fn test_unknown_field_synthesized() {
        let def = resolve("ALARMDEL");
        assert_eq!(def.published_id, "alarmdel");
        assert_eq!(def.value_type, ValueType::Mixed);
        assert!(def.unit.is_none());
        assert!(!def.is_known());
    }

    #[test]
    fn test_catalogue_ids_unique() {
        let ids: HashSet<_> = KNOWN_FIELDS.iter().map(|entry| entry.1).collect();
        assert_eq!(ids.len(), KNOWN_FIELDS.len());
        assert_eq!(known_count(), KNOWN_FIELDS.len());
    }

    #[test]
    fn test_catalogue_ids_never_collide_with_synthesized() {
        for (_, id, ..) in KNOWN_FIELDS {
            assert!(id.contains('.'), "catalogue id {} must be dotted", id);
        }
    }

    #[test]
    fn test_normalized_fields_are_numbers_in_catalogue() {
        for name in crate::normalize::FLOAT_FIELDS
            .iter()
            .chain(crate::normalize::INTEGER_FIELDS)
        {
            assert_eq!(
                lookup(name).map(|d| d.value_type),
                Some(ValueType::Number),
                "{} should be catalogued as a number",
                name
            );
        }
    }
}
