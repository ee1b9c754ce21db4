//! Audio Device Selection
//!
//! Enumeriert cpal-Geräte und entscheidet, welches Gerät aktiv wird.
//! cpal kennt keine stabilen Geräte-IDs, daher ist der Gerätename
//! zugleich ID und Label.

use crate::audio::AudioError;
use crate::storage::DevicePreference;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::Device;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Input,
    Output,
}

/// Beschreibung eines enumerierten Geräts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

impl AudioDeviceInfo {
    fn from_name(name: String, default_name: Option<&str>) -> Self {
        let is_default = default_name == Some(name.as_str());
        Self {
            id: name.clone(),
            label: name,
            is_default,
        }
    }
}

// ============================================================================
// ENUMERATION
// ============================================================================

/// Listet alle Geräte einer Richtung auf
pub fn enumerate(kind: DeviceKind) -> Result<Vec<AudioDeviceInfo>, AudioError> {
    let host = cpal::default_host();

    let default_name = match kind {
        DeviceKind::Input => host.default_input_device(),
        DeviceKind::Output => host.default_output_device(),
    }
    .and_then(|d| d.name().ok());

    let devices = match kind {
        DeviceKind::Input => host.input_devices(),
        DeviceKind::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| AudioDeviceInfo::from_name(name, default_name.as_deref()))
        .collect())
}

/// Sucht das cpal-Gerät zu einer ID
pub fn find_device(kind: DeviceKind, id: &str) -> Result<Option<Device>, AudioError> {
    let host = cpal::default_host();
    let devices = match kind {
        DeviceKind::Input => host.input_devices(),
        DeviceKind::Output => host.output_devices(),
    }
    .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    for device in devices {
        if device.name().ok().as_deref() == Some(id) {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// Plattform-Default-Gerät einer Richtung
pub fn default_device(kind: DeviceKind) -> Option<Device> {
    let host = cpal::default_host();
    match kind {
        DeviceKind::Input => host.default_input_device(),
        DeviceKind::Output => host.default_output_device(),
    }
}

// ============================================================================
// SELECTION RULES
// ============================================================================

/// Auflösung der persistierten Präferenz beim Session-Start.
///
/// Reihenfolge: Präferenz per ID, Präferenz per Label, Plattform-Default,
/// erstes Gerät. Die persistierte Präferenz wird dabei nie verändert.
pub fn resolve_preferred<'a>(
    available: &'a [AudioDeviceInfo],
    preferred: Option<&DevicePreference>,
) -> Option<&'a AudioDeviceInfo> {
    if let Some(pref) = preferred {
        if let Some(device) = available.iter().find(|d| d.id == pref.id) {
            return Some(device);
        }
        if !pref.label.is_empty() {
            if let Some(device) = available.iter().find(|d| d.label == pref.label) {
                return Some(device);
            }
        }
    }

    available
        .iter()
        .find(|d| d.is_default)
        .or_else(|| available.first())
}

/// Entscheidung bei einer Geräteliste-Änderung.
///
/// Gibt `Some` zurück wenn gewechselt werden muss: entweder ist das aktive
/// Gerät verschwunden (dann Default), oder die Präferenz ist neu verfügbar
/// und weicht vom aktiven Gerät ab.
pub fn fallback_switch<'a>(
    available: &'a [AudioDeviceInfo],
    active_id: &str,
    preferred: Option<&DevicePreference>,
) -> Option<&'a AudioDeviceInfo> {
    let active_present = available.iter().any(|d| d.id == active_id);

    if !active_present {
        return available
            .iter()
            .find(|d| d.is_default)
            .or_else(|| available.first());
    }

    if let Some(pref) = preferred {
        if pref.id != active_id {
            if let Some(device) = available.iter().find(|d| d.id == pref.id) {
                return Some(device);
            }
        }
    }

    None
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, is_default: bool) -> AudioDeviceInfo {
        AudioDeviceInfo {
            id: id.to_string(),
            label: id.to_string(),
            is_default,
        }
    }

    fn pref(id: &str, label: &str) -> DevicePreference {
        DevicePreference {
            id: id.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn test_resolve_prefers_exact_id() {
        let list = vec![device("default", true), device("usb-mic", false)];
        let p = pref("usb-mic", "usb-mic");

        let resolved = resolve_preferred(&list, Some(&p)).unwrap();
        assert_eq!(resolved.id, "usb-mic");
    }

    #[test]
    fn test_resolve_falls_back_to_label_match() {
        // ID aus alter Sitzung existiert nicht mehr, Label schon
        let list = vec![device("default", true), device("USB Microphone", false)];
        let p = pref("stale-id-123", "USB Microphone");

        let resolved = resolve_preferred(&list, Some(&p)).unwrap();
        assert_eq!(resolved.id, "USB Microphone");
    }

    #[test]
    fn test_resolve_falls_back_to_platform_default() {
        let list = vec![device("builtin", false), device("default", true)];
        let p = pref("gone", "also gone");

        let resolved = resolve_preferred(&list, Some(&p)).unwrap();
        assert_eq!(resolved.id, "default");
    }

    #[test]
    fn test_resolve_without_preference_or_default_takes_first() {
        let list = vec![device("a", false), device("b", false)];
        let resolved = resolve_preferred(&list, None).unwrap();
        assert_eq!(resolved.id, "a");
    }

    #[test]
    fn test_resolve_empty_list() {
        assert!(resolve_preferred(&[], None).is_none());
    }

    #[test]
    fn test_fallback_switches_to_default_when_active_vanishes() {
        let list = vec![device("default", true), device("other", false)];

        let switched = fallback_switch(&list, "unplugged-headset", None).unwrap();
        assert_eq!(switched.id, "default");
    }

    #[test]
    fn test_fallback_switches_when_preferred_reappears() {
        let list = vec![device("default", true), device("usb-mic", false)];
        let p = pref("usb-mic", "usb-mic");

        let switched = fallback_switch(&list, "default", Some(&p)).unwrap();
        assert_eq!(switched.id, "usb-mic");
    }

    #[test]
    fn test_fallback_applies_to_output_devices() {
        // Gleiche Regeln für Ausgabegeräte: verschwundener Kopfhörer fällt
        // auf den Default zurück, wieder auftauchende Präferenz gewinnt
        let list = vec![device("speakers", true), device("bt-headphones", false)];
        let p = pref("bt-headphones", "bt-headphones");

        let switched = fallback_switch(&list, "usb-dac", None).unwrap();
        assert_eq!(switched.id, "speakers");

        let switched = fallback_switch(&list, "speakers", Some(&p)).unwrap();
        assert_eq!(switched.id, "bt-headphones");
    }

    #[test]
    fn test_fallback_keeps_active_device_when_nothing_changed() {
        let list = vec![device("default", true), device("usb-mic", false)];
        let p = pref("usb-mic", "usb-mic");

        assert!(fallback_switch(&list, "usb-mic", Some(&p)).is_none());
        assert!(fallback_switch(&list, "default", None).is_none());
    }
}
