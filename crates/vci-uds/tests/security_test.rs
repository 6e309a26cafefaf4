//! Security access handshake tests

use std::sync::Arc;

use pretty_assertions::assert_eq;
use vci_uds::transport::mock::MockCommunicator;
use vci_uds::{
    CanFrame, CrcVariant, ManualClock, ResultCode, SecurityAlgoConfig, SecurityError,
    SecurityProvider, Service,
};

const SEED: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

fn service() -> (Service, Arc<MockCommunicator>) {
    let clock = Arc::new(ManualClock::new());
    let mock = Arc::new(MockCommunicator::with_clock(clock.clone()));
    let service = Service::builder(mock.clone()).clock(clock).build().unwrap();
    (service, mock)
}

/// ECU answering level 1 with `seed` and accepting only `expected_key`
fn seed_key_ecu(
    seed: Vec<u8>,
    expected_key: Vec<u8>,
) -> impl FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static {
    move |frame| {
        let len = usize::from(frame.data[0] & 0x0F);
        let request = &frame.data[1..=len];
        match request {
            [0x27, 0x01] => {
                let mut reply = vec![(seed.len() + 2) as u8, 0x67, 0x01];
                reply.extend_from_slice(&seed);
                vec![CanFrame::new(0x7E8, reply)]
            }
            [0x27, 0x02, key @ ..] if key == expected_key.as_slice() => {
                vec![CanFrame::new(0x7E8, vec![0x02, 0x67, 0x02])]
            }
            [0x27, 0x02, ..] => vec![CanFrame::new(0x7E8, vec![0x03, 0x7F, 0x27, 0x35])],
            _ => Vec::new(),
        }
    }
}

#[test]
fn test_xor_handshake_unlocks() {
    let (service, mock) = service();
    mock.set_responder(seed_key_ecu(SEED.to_vec(), vec![0xB4, 0x87, 0x96, 0xE1]));
    assert_eq!(
        service.set_security_config("algorithm = \"xor\"\nsecret = \"a5a5\"\n"),
        ResultCode::Ok
    );

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::Ok);
    assert_eq!(response.payload, vec![0x67, 0x02]);

    let sent = mock.sent_data();
    assert_eq!(sent.len(), 2);
    assert_eq!(&sent[1][..7], &[0x06, 0x27, 0x02, 0xB4, 0x87, 0x96, 0xE1]);
}

#[test]
fn test_wrong_key_is_negative_response() {
    let (service, mock) = service();
    mock.set_responder(seed_key_ecu(SEED.to_vec(), vec![0x00; 4]));
    service.set_security_config("algorithm = \"xor\"\nsecret = \"a5\"\n");

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::NegativeResponse);
    assert_eq!(response.payload, vec![0x7F, 0x27, 0x35]);
}

#[test]
fn test_zero_seed_means_already_unlocked() {
    let (service, mock) = service();
    mock.set_responder(seed_key_ecu(vec![0x00; 4], Vec::new()));
    service.set_security_config("algorithm = \"xor\"\nsecret = \"a5\"\n");

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::Ok);
    assert_eq!(response.payload, vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00]);
    // No key was sent
    assert_eq!(mock.sent_frames().len(), 1);
}

#[test]
fn test_empty_seed_is_invalid() {
    let (service, mock) = service();
    mock.set_responder(seed_key_ecu(Vec::new(), Vec::new()));
    service.set_security_config("algorithm = \"xor\"\nsecret = \"a5\"\n");

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::SecurityInvalidSeed);
    assert_eq!(response.payload, vec![0x67, 0x01]);
    assert_eq!(mock.sent_frames().len(), 1);
}

#[test]
fn test_seed_rejection_is_returned() {
    let (service, mock) = service();
    mock.set_responder(|_| vec![CanFrame::new(0x7E8, vec![0x03, 0x7F, 0x27, 0x37])]);

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::NegativeResponse);
    assert_eq!(response.payload, vec![0x7F, 0x27, 0x37]);
}

#[test]
fn test_unconfigured_algorithm_fails() {
    let (service, mock) = service();
    mock.set_responder(seed_key_ecu(SEED.to_vec(), Vec::new()));

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::SecurityConfigFailed);
    assert_eq!(mock.sent_frames().len(), 1);
}

#[test]
fn test_invalid_level_sends_nothing() {
    let (service, mock) = service();
    assert_eq!(service.security_access(0).result_code, ResultCode::InvalidParam);
    assert_eq!(service.security_access(0x40).result_code, ResultCode::InvalidParam);
    assert!(mock.sent_frames().is_empty());
}

#[test]
fn test_crc_handshake_with_explicit_config() {
    let (service, mock) = service();
    let config = SecurityAlgoConfig::Crc {
        variant: CrcVariant::Crc16Xmodem,
        secret: "0102".to_string(),
    };
    let crc = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);
    let mut digest = crc.digest();
    digest.update(&SEED);
    digest.update(&[0x01, 0x02]);
    digest.update(&[0x01]);
    let expected = digest.finalize().to_be_bytes().to_vec();
    mock.set_responder(seed_key_ecu(SEED.to_vec(), expected));

    let response = service.security_access_with(&vci_uds::ConfiguredKeyProvider, &config, 1);
    assert_eq!(response.result_code, ResultCode::Ok);
}

/// Provider that always returns a fixed key
struct FixedKey(Vec<u8>);

impl SecurityProvider for FixedKey {
    fn calculate_key(
        &self,
        _level: u8,
        _seed: &[u8],
        _config: &SecurityAlgoConfig,
    ) -> Result<Vec<u8>, SecurityError> {
        Ok(self.0.clone())
    }
}

#[test]
fn test_custom_provider_via_builder() {
    let clock = Arc::new(ManualClock::new());
    let mock = Arc::new(MockCommunicator::with_clock(clock.clone()));
    mock.set_responder(seed_key_ecu(SEED.to_vec(), vec![0xCA, 0xFE]));
    let service = Service::builder(mock.clone())
        .clock(clock)
        .security_provider(Arc::new(FixedKey(vec![0xCA, 0xFE])))
        .build()
        .unwrap();

    let response = service.security_access(1);
    assert_eq!(response.result_code, ResultCode::Ok);
    assert_eq!(response.payload, vec![0x67, 0x02]);
}
