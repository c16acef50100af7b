//! Helpers for turning btleplug peripherals into [`PeripheralIdentity`] values.

use btleplug::api::PeripheralProperties;
use btleplug::platform::PeripheralId;

use vaultlink_types::PeripheralIdentity;
use vaultlink_types::uuid::NUS_SERVICE;

/// Address CoreBluetooth reports for every peripheral.
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms they are MAC
/// addresses. This strips the `PeripheralId(...)` wrapper from the debug form.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_id_wrapper(&format!("{:?}", id))
}

fn strip_id_wrapper(debug: &str) -> String {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Create an identifier string from an address and peripheral ID.
///
/// On macOS where addresses are hidden, uses the peripheral ID.
/// On other platforms, uses the Bluetooth address.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    choose_identifier(address, || format_peripheral_id(peripheral_id))
}

fn choose_identifier(address: &str, fallback: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        fallback()
    } else {
        address.to_string()
    }
}

/// Build the identity of a peripheral from its advertised properties.
pub fn peripheral_identity(
    id: &PeripheralId,
    properties: Option<&PeripheralProperties>,
) -> PeripheralIdentity {
    match properties {
        Some(props) => PeripheralIdentity {
            id: create_identifier(&props.address.to_string(), id),
            name: props.local_name.clone(),
            mtu: None,
        },
        None => PeripheralIdentity::new(format_peripheral_id(id)),
    }
}

/// Whether the advertisement announces the vault's UART service.
pub fn advertises_vault_service(properties: &PeripheralProperties) -> bool {
    properties.services.contains(&NUS_SERVICE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_id_wrapper() {
        assert_eq!(strip_id_wrapper("PeripheralId(AA:BB:CC:DD:EE:FF)"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(
            strip_id_wrapper("PeripheralId(6e400001-b5a3-f393-e0a9-e50e24dcca9e)"),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(strip_id_wrapper("plain"), "plain");
    }

    #[test]
    fn test_identifier_prefers_address() {
        let id = choose_identifier("AA:BB:CC:DD:EE:FF", || "uuid".to_string());
        assert_eq!(id, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_identifier_falls_back_when_address_hidden() {
        let id = choose_identifier(HIDDEN_ADDRESS, || "uuid".to_string());
        assert_eq!(id, "uuid");
    }

    #[test]
    fn test_vault_service_detection() {
        let mut properties = PeripheralProperties::default();
        assert!(!advertises_vault_service(&properties));
        properties.services.push(NUS_SERVICE);
        assert!(advertises_vault_service(&properties));
    }
}
