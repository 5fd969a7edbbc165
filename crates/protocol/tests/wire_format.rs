//! Integration tests for the sidetone wire format
//!
//! The device only reacts to the exact byte sequences below, so these tests
//! pin every field of both commands.
//!
//! Run with: `cargo test -p protocol --test wire_format`

use protocol::{
    ControlRequest, DEVICE_TABLE, DeviceMatch, Direction, ProtocolError, Recipient, RequestKind,
    SETUP_PACKET_LEN, STATE_PAYLOAD, STATE_REQUEST, TransferStatus, VOLUME_PAYLOAD,
    VOLUME_REQUEST,
};

mod commands {
    use super::*;

    #[test]
    fn test_volume_command_fields() {
        assert_eq!(VOLUME_REQUEST.request_type, 0x21);
        assert_eq!(VOLUME_REQUEST.request, 1);
        assert_eq!(VOLUME_REQUEST.value, 0x0200);
        assert_eq!(VOLUME_REQUEST.index, 0x0B00);
        assert_eq!(VOLUME_REQUEST.length, 2);
        assert_eq!(VOLUME_PAYLOAD, [0x00, 0xEA]);
    }

    #[test]
    fn test_state_command_fields() {
        assert_eq!(STATE_REQUEST.request_type, 0x21);
        assert_eq!(STATE_REQUEST.request, 1);
        assert_eq!(STATE_REQUEST.value, 0x0100);
        assert_eq!(STATE_REQUEST.index, 0x0B00);
        assert_eq!(STATE_REQUEST.length, 1);
        assert_eq!(STATE_PAYLOAD, [0x00]);
    }

    #[test]
    fn test_setup_packets_are_little_endian() {
        let volume = VOLUME_REQUEST.to_bytes();
        let state = STATE_REQUEST.to_bytes();

        assert_eq!(volume.len(), SETUP_PACKET_LEN);
        assert_eq!(&volume[2..4], &[0x00, 0x02]); // wValue 0x0200
        assert_eq!(&volume[4..6], &[0x00, 0x0B]); // wIndex 0x0B00
        assert_eq!(&volume[6..8], &[0x02, 0x00]); // wLength 2

        assert_eq!(&state[2..4], &[0x00, 0x01]); // wValue 0x0100
        assert_eq!(&state[6..8], &[0x01, 0x00]); // wLength 1
    }

    #[test]
    fn test_both_commands_are_class_out_to_interface() {
        for request in [VOLUME_REQUEST, STATE_REQUEST] {
            assert_eq!(request.direction(), Direction::Out);
            assert_eq!(request.kind(), RequestKind::Class);
            assert_eq!(request.recipient(), Recipient::Interface);
        }
    }

    #[test]
    fn test_decode_encoded_templates() {
        let decoded = ControlRequest::from_bytes(&STATE_REQUEST.to_bytes()).unwrap();
        assert_eq!(decoded, STATE_REQUEST);
    }

    #[test]
    fn test_decode_rejects_truncated_packet() {
        let bytes = VOLUME_REQUEST.to_bytes();
        let err = ControlRequest::from_bytes(&bytes[..7]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidSetupLength { actual: 7, .. }
        ));
    }
}

mod match_table {
    use super::*;

    #[test]
    fn test_only_the_sound_card_matches() {
        assert_eq!(DEVICE_TABLE.len(), 1);
        assert!(DeviceMatch::lookup(DEVICE_TABLE, 0x1532, 0x0529).is_some());

        // Other Razer products must not bind
        assert!(DeviceMatch::lookup(DEVICE_TABLE, 0x1532, 0x0084).is_none());
    }
}

mod status {
    use super::*;

    #[test]
    fn test_failure_statuses_are_negative() {
        for status in [
            TransferStatus::Pipe,
            TransferStatus::Timeout,
            TransferStatus::NoDevice,
            TransferStatus::Cancelled,
            TransferStatus::Overflow,
            TransferStatus::Io,
        ] {
            assert!(status.code() < 0, "{:?} should be negative", status);
            assert!(!status.is_success());
        }
    }

    #[test]
    fn test_display_contains_code() {
        assert!(TransferStatus::Pipe.to_string().contains("-32"));
        assert_eq!(TransferStatus::Completed.to_string(), "completed");
    }
}
