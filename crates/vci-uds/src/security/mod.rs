//! Security access (UDS 0x27) key derivation
//!
//! The seed/key handshake itself is driven by
//! [`Service::security_access`](crate::Service::security_access); this
//! module supplies the key calculation behind the [`SecurityProvider`]
//! trait and the message helpers for both handshake steps.

use crc::{Crc, CRC_16_IBM_3740, CRC_16_MODBUS, CRC_16_XMODEM, CRC_32_ISO_HDLC, CRC_32_MPEG_2};

use crate::config::{CrcVariant, SecurityAlgoConfig};
use crate::error::{ResultCode, SecurityError};
use crate::uds::{positive_response_sid, service_id};

const CRC16_CCITT_FALSE: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC16_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
const CRC16_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32_MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Highest security level addressable by a 0x27 sub-function pair
pub const MAX_SECURITY_LEVEL: u8 = 0x3F;

/// Seed to key derivation
///
/// Implementations must be deterministic: the same level, seed and config
/// always produce the same key.
pub trait SecurityProvider: Send + Sync {
    fn calculate_key(
        &self,
        level: u8,
        seed: &[u8],
        config: &SecurityAlgoConfig,
    ) -> Result<Vec<u8>, SecurityError>;
}

/// Provider implementing the algorithms selectable in [`SecurityAlgoConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredKeyProvider;

fn decode_secret(secret: &str) -> Result<Vec<u8>, SecurityError> {
    hex::decode(secret.trim())
        .map_err(|e| SecurityError::InvalidConfig(format!("secret is not valid hex: {}", e)))
}

impl SecurityProvider for ConfiguredKeyProvider {
    fn calculate_key(
        &self,
        level: u8,
        seed: &[u8],
        config: &SecurityAlgoConfig,
    ) -> Result<Vec<u8>, SecurityError> {
        if seed.is_empty() {
            return Err(SecurityError::EmptySeed);
        }

        match config {
            SecurityAlgoConfig::None => Err(SecurityError::Unconfigured),
            SecurityAlgoConfig::Xor { secret } => {
                let secret = decode_secret(secret)?;
                if secret.is_empty() {
                    return Err(SecurityError::InvalidConfig(
                        "xor secret must not be empty".to_string(),
                    ));
                }
                Ok(seed
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ secret[i % secret.len()])
                    .collect())
            }
            SecurityAlgoConfig::Crc { variant, secret } => {
                let secret = decode_secret(secret)?;
                let parts: [&[u8]; 3] = [seed, &secret, &[level]];
                Ok(match variant {
                    CrcVariant::Crc16CcittFalse => crc16(&CRC16_CCITT_FALSE, &parts),
                    CrcVariant::Crc16Modbus => crc16(&CRC16_MODBUS, &parts),
                    CrcVariant::Crc16Xmodem => crc16(&CRC16_XMODEM, &parts),
                    CrcVariant::Crc32 => crc32(&CRC32, &parts),
                    CrcVariant::Crc32Mpeg2 => crc32(&CRC32_MPEG2, &parts),
                })
            }
        }
    }
}

fn crc16(alg: &Crc<u16>, parts: &[&[u8]]) -> Vec<u8> {
    let mut digest = alg.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize().to_be_bytes().to_vec()
}

fn crc32(alg: &Crc<u32>, parts: &[&[u8]]) -> Vec<u8> {
    let mut digest = alg.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize().to_be_bytes().to_vec()
}

// =============================================================================
// Handshake messages
// =============================================================================

fn seed_sub_function(level: u8) -> u8 {
    level.wrapping_mul(2).wrapping_sub(1)
}

/// `[0x27, 2L-1]`
pub fn seed_request(level: u8) -> Result<Vec<u8>, ResultCode> {
    if level == 0 || level > MAX_SECURITY_LEVEL {
        return Err(ResultCode::InvalidParam);
    }
    Ok(vec![service_id::SECURITY_ACCESS, seed_sub_function(level)])
}

/// `[0x27, 2L] ++ key`
pub fn key_request(level: u8, key: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(key.len() + 2);
    request.push(service_id::SECURITY_ACCESS);
    request.push(level.wrapping_mul(2));
    request.extend_from_slice(key);
    request
}

/// Extract the seed from a `[0x67, 2L-1, seed...]` response
pub fn extract_seed(level: u8, response: &[u8]) -> Result<&[u8], ResultCode> {
    let expected_sid = positive_response_sid(service_id::SECURITY_ACCESS);
    match response {
        [sid, sub, seed @ ..] if *sid == expected_sid && *sub == seed_sub_function(level) => {
            if seed.is_empty() {
                Err(ResultCode::SecurityInvalidSeed)
            } else {
                Ok(seed)
            }
        }
        _ => Err(ResultCode::SecurityInvalidSeed),
    }
}

/// A seed of all zero bytes means the level is already unlocked
pub fn is_unlocked_seed(seed: &[u8]) -> bool {
    !seed.is_empty() && seed.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn xor(secret: &str) -> SecurityAlgoConfig {
        SecurityAlgoConfig::Xor {
            secret: secret.to_string(),
        }
    }

    #[test]
    fn test_xor_key_cycles_secret() {
        let key = ConfiguredKeyProvider
            .calculate_key(1, &[0x11, 0x22, 0x33, 0x44, 0x55], &xor("ff00"))
            .unwrap();
        assert_eq!(key, vec![0xEE, 0x22, 0xCC, 0x44, 0xAA]);
    }

    #[test]
    fn test_crc32_key_is_deterministic_and_level_dependent() {
        let config = SecurityAlgoConfig::Crc {
            variant: CrcVariant::Crc32,
            secret: "c0ffee".to_string(),
        };
        let a = ConfiguredKeyProvider.calculate_key(1, &[1, 2, 3, 4], &config).unwrap();
        let b = ConfiguredKeyProvider.calculate_key(1, &[1, 2, 3, 4], &config).unwrap();
        let c = ConfiguredKeyProvider.calculate_key(3, &[1, 2, 3, 4], &config).unwrap();

        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_crc_matches_checksum_of_concatenation() {
        let config = SecurityAlgoConfig::Crc {
            variant: CrcVariant::Crc16CcittFalse,
            secret: "0102".to_string(),
        };
        let key = ConfiguredKeyProvider.calculate_key(5, &[0xAA, 0xBB], &config).unwrap();
        let expected = CRC16_CCITT_FALSE.checksum(&[0xAA, 0xBB, 0x01, 0x02, 0x05]);
        assert_eq!(key, expected.to_be_bytes().to_vec());
    }

    #[rstest]
    #[case::unconfigured(SecurityAlgoConfig::None, SecurityError::Unconfigured)]
    #[case::bad_hex(xor("zz"), SecurityError::InvalidConfig(String::new()))]
    #[case::empty_secret(xor(""), SecurityError::InvalidConfig(String::new()))]
    fn test_configuration_errors(#[case] config: SecurityAlgoConfig, #[case] expected: SecurityError) {
        let err = ConfiguredKeyProvider.calculate_key(1, &[1], &config).unwrap_err();
        assert_eq!(
            std::mem::discriminant(&err),
            std::mem::discriminant(&expected)
        );
        assert_eq!(ResultCode::from(err), ResultCode::SecurityConfigFailed);
    }

    #[test]
    fn test_empty_seed() {
        assert_eq!(
            ConfiguredKeyProvider.calculate_key(1, &[], &xor("aa")),
            Err(SecurityError::EmptySeed)
        );
    }

    #[test]
    fn test_handshake_messages() {
        assert_eq!(seed_request(1), Ok(vec![0x27, 0x01]));
        assert_eq!(seed_request(0x11), Ok(vec![0x27, 0x21]));
        assert_eq!(seed_request(0), Err(ResultCode::InvalidParam));
        assert_eq!(seed_request(0x40), Err(ResultCode::InvalidParam));
        assert_eq!(key_request(1, &[0xDE, 0xAD]), vec![0x27, 0x02, 0xDE, 0xAD]);
    }

    #[test]
    fn test_extract_seed() {
        assert_eq!(extract_seed(1, &[0x67, 0x01, 0x12, 0x34]), Ok(&[0x12, 0x34][..]));
        assert_eq!(extract_seed(1, &[0x67, 0x01]), Err(ResultCode::SecurityInvalidSeed));
        assert_eq!(extract_seed(1, &[0x67, 0x03, 0x12]), Err(ResultCode::SecurityInvalidSeed));
        assert_eq!(extract_seed(1, &[0x50, 0x01, 0x12]), Err(ResultCode::SecurityInvalidSeed));
    }

    #[test]
    fn test_unlocked_seed() {
        assert!(is_unlocked_seed(&[0, 0, 0, 0]));
        assert!(!is_unlocked_seed(&[0, 1]));
        assert!(!is_unlocked_seed(&[]));
    }
}
