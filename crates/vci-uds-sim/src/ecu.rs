//! Simulated ECU application layer
//!
//! Turns one complete UDS request into the UDS messages the ECU sends back.
//! Transport framing is handled by [`EcuNode`](crate::node::EcuNode).

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};
use vci_uds::uds::{positive_response_sid, service_id};

use crate::config::EcuConfig;
use crate::error::SimResult;

/// Negative response codes used by the simulator
pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
    pub const INCORRECT_MESSAGE_LENGTH: u8 = 0x13;
    pub const REQUEST_SEQUENCE_ERROR: u8 = 0x24;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const SECURITY_ACCESS_DENIED: u8 = 0x33;
    pub const INVALID_KEY: u8 = 0x35;
    pub const RESPONSE_PENDING: u8 = 0x78;
}

pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(positive_response_sid(sid));
    response.extend_from_slice(data);
    response
}

pub fn negative_response(sid: u8, code: u8) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, sid, code]
}

struct SecurityState {
    unlocked: bool,
    /// Seed handed out for the level awaiting a key
    pending: Option<(u8, Vec<u8>)>,
}

/// Simulated ECU state
pub struct SimulatedEcu {
    name: String,
    secret: Vec<u8>,
    routine_pending_count: u32,
    session: RwLock<u8>,
    security: RwLock<SecurityState>,
    dids: RwLock<HashMap<u16, Vec<u8>>>,
}

impl SimulatedEcu {
    pub fn from_config(config: &EcuConfig) -> SimResult<Self> {
        let mut dids = HashMap::new();
        for did in &config.dids {
            dids.insert(did.did, did.value()?);
        }
        Ok(Self {
            name: config.name.clone(),
            secret: config.security_key()?,
            routine_pending_count: config.routine_pending_count,
            session: RwLock::new(0x01),
            security: RwLock::new(SecurityState {
                unlocked: false,
                pending: None,
            }),
            dids: RwLock::new(dids),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> u8 {
        *self.session.read()
    }

    pub fn is_unlocked(&self) -> bool {
        self.security.read().unlocked
    }

    pub fn did(&self, did: u16) -> Option<Vec<u8>> {
        self.dids.read().get(&did).cloned()
    }

    /// Process a UDS request
    ///
    /// Returns every message to transmit in order; an empty list means the
    /// response is suppressed.
    pub fn process_request(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let Some(&sid) = request.first() else {
            return vec![negative_response(0x00, nrc::INCORRECT_MESSAGE_LENGTH)];
        };

        match sid {
            service_id::DIAGNOSTIC_SESSION_CONTROL => vec![self.handle_session_control(request)],
            service_id::ECU_RESET => vec![self.handle_ecu_reset(request)],
            service_id::TESTER_PRESENT => self.handle_tester_present(request).into_iter().collect(),
            service_id::SECURITY_ACCESS => vec![self.handle_security_access(request)],
            service_id::READ_DATA_BY_ID => vec![self.handle_read_data_by_id(request)],
            service_id::WRITE_DATA_BY_ID => vec![self.handle_write_data_by_id(request)],
            service_id::ROUTINE_CONTROL => self.handle_routine_control(request),
            _ => {
                debug!(ecu = %self.name, service_id = sid, "Unsupported service");
                vec![negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)]
            }
        }
    }

    fn handle_session_control(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::DIAGNOSTIC_SESSION_CONTROL;
        let [_, session] = request else {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        };

        match session {
            0x01..=0x03 => {
                let previous = std::mem::replace(&mut *self.session.write(), *session);
                if previous != *session {
                    let mut security = self.security.write();
                    if security.unlocked {
                        info!(ecu = %self.name, "Session change: security locked");
                    }
                    security.unlocked = false;
                    security.pending = None;
                }
                info!(ecu = %self.name, session = format_args!("0x{:02X}", session), "Session changed");
                // P2 = 50 ms, P2* = 5000 ms (10 ms resolution)
                positive_response(sid, &[*session, 0x00, 0x32, 0x01, 0xF4])
            }
            _ => negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED),
        }
    }

    fn handle_ecu_reset(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::ECU_RESET;
        let [_, reset_type] = request else {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        if !matches!(reset_type, 0x01..=0x03) {
            return negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED);
        }

        info!(ecu = %self.name, reset_type, "ECU reset");
        *self.session.write() = 0x01;
        let mut security = self.security.write();
        security.unlocked = false;
        security.pending = None;
        positive_response(sid, &[*reset_type])
    }

    fn handle_tester_present(&self, request: &[u8]) -> Option<Vec<u8>> {
        let sid = service_id::TESTER_PRESENT;
        let [_, sub_function] = request else {
            return Some(negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH));
        };
        if sub_function & 0x80 != 0 {
            debug!(ecu = %self.name, "Tester present (suppressed response)");
            return None;
        }
        Some(positive_response(sid, &[sub_function & 0x7F]))
    }

    fn handle_security_access(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::SECURITY_ACCESS;
        let Some(&sub_function) = request.get(1) else {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        };
        let mut security = self.security.write();

        if sub_function % 2 == 1 {
            if security.unlocked {
                info!(ecu = %self.name, "Security access: already unlocked, zero seed");
                return positive_response(sid, &[sub_function, 0, 0, 0, 0]);
            }

            let mut rng = rand::thread_rng();
            // A zero seed would read as "already unlocked"
            let seed: Vec<u8> = (0..4).map(|_| rng.gen_range(1..=u8::MAX)).collect();
            info!(ecu = %self.name, seed = ?seed, "Security access: providing seed");
            security.pending = Some((sub_function, seed.clone()));

            let mut data = vec![sub_function];
            data.extend_from_slice(&seed);
            return positive_response(sid, &data);
        }

        let Some((seed_sub_function, seed)) = security.pending.take() else {
            return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
        };
        if seed_sub_function.wrapping_add(1) != sub_function {
            return negative_response(sid, nrc::REQUEST_SEQUENCE_ERROR);
        }

        let expected: Vec<u8> = seed
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ self.secret[i % self.secret.len()])
            .collect();
        if request[2..] == expected[..] {
            info!(ecu = %self.name, "Security access: key accepted");
            security.unlocked = true;
            positive_response(sid, &[sub_function])
        } else {
            info!(
                ecu = %self.name,
                expected = ?expected,
                received = ?&request[2..],
                "Security access: invalid key (NRC 0x35)"
            );
            negative_response(sid, nrc::INVALID_KEY)
        }
    }

    fn handle_read_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::READ_DATA_BY_ID;
        if request.len() < 3 || request.len() % 2 == 0 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }

        let dids = self.dids.read();
        let mut data = Vec::new();
        for pair in request[1..].chunks_exact(2) {
            let did = u16::from_be_bytes([pair[0], pair[1]]);
            let Some(value) = dids.get(&did) else {
                debug!(ecu = %self.name, did = format_args!("0x{:04X}", did), "Unknown DID");
                return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
            };
            data.extend_from_slice(pair);
            data.extend_from_slice(value);
        }
        positive_response(sid, &data)
    }

    fn handle_write_data_by_id(&self, request: &[u8]) -> Vec<u8> {
        let sid = service_id::WRITE_DATA_BY_ID;
        if request.len() < 4 {
            return negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH);
        }
        if !self.is_unlocked() {
            return negative_response(sid, nrc::SECURITY_ACCESS_DENIED);
        }

        let did = u16::from_be_bytes([request[1], request[2]]);
        let mut dids = self.dids.write();
        let Some(value) = dids.get_mut(&did) else {
            return negative_response(sid, nrc::REQUEST_OUT_OF_RANGE);
        };
        *value = request[3..].to_vec();
        info!(ecu = %self.name, did = format_args!("0x{:04X}", did), len = value.len(), "DID written");
        positive_response(sid, &request[1..3])
    }

    fn handle_routine_control(&self, request: &[u8]) -> Vec<Vec<u8>> {
        let sid = service_id::ROUTINE_CONTROL;
        if request.len() < 4 {
            return vec![negative_response(sid, nrc::INCORRECT_MESSAGE_LENGTH)];
        }
        if !matches!(request[1], 0x01..=0x03) {
            return vec![negative_response(sid, nrc::SUB_FUNCTION_NOT_SUPPORTED)];
        }

        let mut messages: Vec<Vec<u8>> = (0..self.routine_pending_count)
            .map(|_| negative_response(sid, nrc::RESPONSE_PENDING))
            .collect();
        // Routine status 0x00: completed
        messages.push(positive_response(sid, &[request[1], request[2], request[3], 0x00]));
        debug!(
            ecu = %self.name,
            pending = self.routine_pending_count,
            "Routine control with delayed result"
        );
        messages
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ecu() -> SimulatedEcu {
        SimulatedEcu::from_config(&EcuConfig::default()).unwrap()
    }

    fn key_for(seed_response: &[u8], secret: &[u8]) -> Vec<u8> {
        seed_response[2..]
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ secret[i % secret.len()])
            .collect()
    }

    #[test]
    fn test_read_vin() {
        let responses = ecu().process_request(&[0x22, 0xF1, 0x90]);
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(&responses[0][3..], b"WF0XXXGCDX1234567");
    }

    #[test]
    fn test_read_multiple_dids() {
        let responses = ecu().process_request(&[0x22, 0xF1, 0x87, 0xF1, 0x90]);
        let response = &responses[0];
        assert_eq!(&response[..3], &[0x62, 0xF1, 0x87]);
        assert_eq!(response.len(), 1 + 2 + 12 + 2 + 17);
    }

    #[test]
    fn test_unknown_did() {
        let responses = ecu().process_request(&[0x22, 0x12, 0x34]);
        assert_eq!(responses, vec![vec![0x7F, 0x22, 0x31]]);
    }

    #[test]
    fn test_tester_present_suppression() {
        let ecu = ecu();
        assert!(ecu.process_request(&[0x3E, 0x80]).is_empty());
        assert_eq!(ecu.process_request(&[0x3E, 0x00]), vec![vec![0x7E, 0x00]]);
    }

    #[test]
    fn test_security_handshake_and_zero_seed() {
        let ecu = ecu();
        let seed_response = ecu.process_request(&[0x27, 0x01]).remove(0);
        assert_eq!(&seed_response[..2], &[0x67, 0x01]);
        assert!(seed_response[2..].iter().all(|&b| b != 0));

        let mut request = vec![0x27, 0x02];
        request.extend(key_for(&seed_response, &[0xA5, 0xA5]));
        assert_eq!(ecu.process_request(&request), vec![vec![0x67, 0x02]]);
        assert!(ecu.is_unlocked());

        let again = ecu.process_request(&[0x27, 0x01]).remove(0);
        assert_eq!(again, vec![0x67, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn test_security_wrong_key_and_sequence() {
        let ecu = ecu();
        assert_eq!(
            ecu.process_request(&[0x27, 0x02, 0x00]),
            vec![vec![0x7F, 0x27, 0x24]]
        );
        ecu.process_request(&[0x27, 0x01]);
        assert_eq!(
            ecu.process_request(&[0x27, 0x02, 0, 0, 0, 0]),
            vec![vec![0x7F, 0x27, 0x35]]
        );
        assert!(!ecu.is_unlocked());
    }

    #[test]
    fn test_session_change_locks_security() {
        let ecu = ecu();
        let seed_response = ecu.process_request(&[0x27, 0x01]).remove(0);
        let mut request = vec![0x27, 0x02];
        request.extend(key_for(&seed_response, &[0xA5, 0xA5]));
        ecu.process_request(&request);
        assert!(ecu.is_unlocked());

        let response = ecu.process_request(&[0x10, 0x03]).remove(0);
        assert_eq!(&response[..2], &[0x50, 0x03]);
        assert_eq!(ecu.session(), 0x03);
        assert!(!ecu.is_unlocked());
    }

    #[test]
    fn test_write_requires_unlock() {
        let ecu = ecu();
        assert_eq!(
            ecu.process_request(&[0x2E, 0xF1, 0x87, 0x41]),
            vec![vec![0x7F, 0x2E, 0x33]]
        );
    }

    #[test]
    fn test_routine_control_emits_pending_first() {
        let responses = ecu().process_request(&[0x31, 0x01, 0xFF, 0x00]);
        assert_eq!(
            responses,
            vec![
                vec![0x7F, 0x31, 0x78],
                vec![0x7F, 0x31, 0x78],
                vec![0x71, 0x01, 0xFF, 0x00, 0x00],
            ]
        );
    }

    #[test]
    fn test_unsupported_service() {
        assert_eq!(ecu().process_request(&[0x85, 0x01]), vec![vec![0x7F, 0x85, 0x11]]);
    }
}
