//! Platform-agnostic types for the BLE password vault protocol.
//!
//! This crate provides the shared vocabulary of the device link: command
//! envelopes, response kinds, peripheral identities, the connection state
//! enum and the chunk header that prefixes multi-notification responses.
//!
//! # Example
//!
//! ```
//! use vaultlink_types::{ChunkHeader, Command, ResponseKind};
//!
//! let cmd = Command::new("list");
//! assert_eq!(cmd.to_json(), r#"{"cmd":"list"}"#);
//! assert_eq!(ResponseKind::default(), ResponseKind::Structured);
//! assert_eq!(ChunkHeader::new(21, 1, 21).encode(), "21,1,21\n");
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use types::{ChunkHeader, Command, ConnectionState, PeripheralIdentity, ResponseKind};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- ChunkHeader parsing tests ---

    #[test]
    fn test_parse_header_with_data() {
        let data = b"28,3,10\n{\"part1\":\"hello\"";
        let (header, len) = ChunkHeader::parse_prefix(data).unwrap();

        assert_eq!(header.total_bytes, 28);
        assert_eq!(header.chunk_count, 3);
        assert_eq!(header.chunk_size, 10);
        assert_eq!(&data[len..], b"{\"part1\":\"hello\"");
    }

    #[test]
    fn test_parse_header_alone() {
        let (header, len) = ChunkHeader::parse_prefix(b"21,1,21\n").unwrap();
        assert_eq!(header, ChunkHeader::new(21, 1, 21));
        assert_eq!(len, 8);
    }

    #[test]
    fn test_parse_header_requires_newline() {
        assert!(ChunkHeader::parse_prefix(b"21,1,21").is_none());
    }

    #[test]
    fn test_parse_header_rejects_text() {
        assert!(ChunkHeader::parse_prefix(b"this is not a header").is_none());
        assert!(ChunkHeader::parse_prefix(b"OK\n").is_none());
        assert!(ChunkHeader::parse_prefix(b"{\"a\":1}\n").is_none());
    }

    #[test]
    fn test_parse_header_rejects_wrong_arity() {
        assert!(ChunkHeader::parse_prefix(b"1,2\n").is_none());
        assert!(ChunkHeader::parse_prefix(b"1,2,3,4\n").is_none());
        assert!(ChunkHeader::parse_prefix(b",2,3\n").is_none());
    }

    #[test]
    fn test_parse_header_rejects_signs_and_spaces() {
        assert!(ChunkHeader::parse_prefix(b"-1,2,3\n").is_none());
        assert!(ChunkHeader::parse_prefix(b"1, 2,3\n").is_none());
        assert!(ChunkHeader::parse_prefix(b"+1,2,3\n").is_none());
    }

    #[test]
    fn test_parse_header_must_be_at_start() {
        assert!(ChunkHeader::parse_prefix(b"x28,3,10\n").is_none());
    }

    #[test]
    fn test_parse_header_overflow_is_not_a_header() {
        assert!(ChunkHeader::parse_prefix(b"1,99999999999999999999,3\n").is_none());
    }

    #[test]
    fn test_header_from_str_errors() {
        let err = "a,b,c".parse::<ChunkHeader>().unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader(_)));
        assert!(err.to_string().contains("a,b,c"));

        let err = "1,4294967296,3".parse::<ChunkHeader>().unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue(_)));
    }

    #[test]
    fn test_header_encode_parses_back() {
        let header = ChunkHeader::new(500, 4, 128);
        let encoded = header.encode();
        let (parsed, len) = ChunkHeader::parse_prefix(encoded.as_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(len, encoded.len());
    }

    // --- Command envelope tests ---

    #[test]
    fn test_command_envelope_contains_name_and_params() {
        let cmd = Command::new("typeRaw")
            .with_param("text", "hunter2")
            .with_param("ret", "true");

        assert_eq!(
            cmd.to_envelope(),
            json!({"cmd": "typeRaw", "text": "hunter2", "ret": "true"})
        );
    }

    #[test]
    fn test_command_cmd_param_cannot_shadow_name() {
        let cmd = Command::new("list").with_param("cmd", "reset");
        assert_eq!(cmd.to_envelope(), json!({"cmd": "list"}));
        assert!(cmd.param("cmd").is_none());
    }

    #[test]
    fn test_command_optional_params_are_omitted() {
        let cmd = Command::new("editPass")
            .with_param("id", 4)
            .with_optional("name", Some("mail"))
            .with_optional::<String>("password", None)
            .with_optional::<u32>("layout", None);

        assert_eq!(cmd.to_envelope(), json!({"cmd": "editPass", "id": 4, "name": "mail"}));
    }

    #[test]
    fn test_command_from_envelope() {
        let value = json!({"cmd": "fetchPass", "id": 7});
        let cmd = Command::from_envelope(&value).unwrap();
        assert_eq!(cmd.name(), "fetchPass");
        assert_eq!(cmd.param("id"), Some(&json!(7)));

        assert!(Command::from_envelope(&json!({"id": 7})).is_none());
        assert!(Command::from_envelope(&json!([1, 2])).is_none());
        assert!(Command::from_envelope(&json!({"cmd": 5})).is_none());
    }

    #[test]
    fn test_command_bytes_are_utf8_json() {
        let cmd = Command::new("typeRaw").with_param("text", "héllo");
        let bytes = cmd.to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["text"], "héllo");
    }

    // --- PeripheralIdentity tests ---

    #[test]
    fn test_identity_same_device_ignores_name_and_case() {
        let a = PeripheralIdentity::with_name("AA:BB:CC:DD:EE:FF", "Vault");
        let b = PeripheralIdentity::new("aa:bb:cc:dd:ee:ff").mtu(247);
        assert!(a.same_device(&b));
        assert!(a.matches_id("aa:bb:cc:dd:ee:ff"));
        assert!(!a.matches_id("11:22:33:44:55:66"));
    }

    #[test]
    fn test_identity_max_write_len() {
        let id = PeripheralIdentity::new("x");
        assert_eq!(id.max_write_len(23), 20);
        assert_eq!(id.max_write_len(185), 182);
        assert_eq!(id.clone().mtu(247).max_write_len(23), 244);
        // Never below the BLE minimum payload.
        assert_eq!(id.mtu(5).max_write_len(23), 20);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(
            PeripheralIdentity::with_name("AA", "Vault").to_string(),
            "Vault (AA)"
        );
        assert_eq!(PeripheralIdentity::new("AA").to_string(), "AA");
        assert_eq!(PeripheralIdentity::new("AA").display_name(), "AA");
    }

    // --- Enum tests ---

    #[test]
    fn test_connection_state_default_and_display() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
    }

    #[test]
    fn test_response_kind_display() {
        assert_eq!(ResponseKind::Structured.to_string(), "structured");
        assert_eq!(ResponseKind::RawText.to_string(), "raw-text");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_connection_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Connected).unwrap();
        assert_eq!(json, "\"connected\"");
        let kind: ResponseKind = serde_json::from_str("\"raw_text\"").unwrap();
        assert_eq!(kind, ResponseKind::RawText);
    }
}
