//! Bluetooth UUIDs for the vault device.
//!
//! The vault exposes the Nordic UART Service (NUS): one characteristic the
//! app writes requests to and one the device notifies responses on.

use uuid::{Uuid, uuid};

// --- Nordic UART Service ---

/// Nordic UART Service UUID, also used as the scan filter.
pub const NUS_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// TX characteristic (app -> device, write).
pub const NUS_TX: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// RX characteristic (device -> app, notify).
pub const NUS_RX: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// ATT protocol overhead subtracted from the negotiated MTU for each write.
pub const ATT_OVERHEAD: usize = 3;

/// BLE default ATT MTU used when none was negotiated.
pub const DEFAULT_ATT_MTU: usize = 23;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nus_service_uuid() {
        assert_eq!(
            NUS_SERVICE.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_nus_characteristics_share_base() {
        let tx = NUS_TX.to_string();
        let rx = NUS_RX.to_string();
        assert_eq!(&tx[8..], &rx[8..]);
        assert_ne!(NUS_TX, NUS_RX);
        assert!(tx.starts_with("6e400002"));
        assert!(rx.starts_with("6e400003"));
    }

    #[test]
    fn test_default_mtu_leaves_payload_room() {
        assert_eq!(DEFAULT_ATT_MTU - ATT_OVERHEAD, 20);
    }
}
