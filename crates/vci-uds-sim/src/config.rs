//! Simulator configuration
//!
//! One TOML file describes the tester session and every simulated ECU on
//! the loopback bus:
//!
//! ```toml
//! [tester]
//! request_id = 0x7E0
//! response_id = 0x7E8
//!
//! [[ecus]]
//! name = "engine"
//! request_id = 0x7E0
//! response_id = 0x7E8
//! security_secret = "a5a5"
//!
//! [[ecus.dids]]
//! did = 0xF190
//! ascii = "WF0XXXGCDX1234567"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use vci_uds::{CanType, SecurityAlgoConfig, SessionContext};

use crate::error::{SimError, SimResult};

/// Complete simulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Session used by the tester-side service
    #[serde(default)]
    pub tester: SessionContext,

    /// ECUs attached to the bus
    #[serde(default = "default_ecus")]
    pub ecus: Vec<EcuConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tester: SessionContext::default(),
            ecus: default_ecus(),
        }
    }
}

fn default_ecus() -> Vec<EcuConfig> {
    vec![EcuConfig::default()]
}

impl SimConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> SimResult<Self> {
        let config: SimConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        self.tester
            .validate()
            .map_err(|e| SimError::Config(e.to_string()))?;
        if self.ecus.is_empty() {
            return Err(SimError::Config("at least one ECU is required".to_string()));
        }
        for ecu in &self.ecus {
            ecu.security_key()?;
            for did in &ecu.dids {
                did.value()?;
            }
        }
        Ok(())
    }

    /// Security algorithm matching the first ECU's secret
    pub fn tester_security(&self) -> SecurityAlgoConfig {
        match self.ecus.first() {
            Some(ecu) => SecurityAlgoConfig::Xor {
                secret: ecu.security_secret.clone(),
            },
            None => SecurityAlgoConfig::None,
        }
    }
}

/// One simulated ECU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// CAN ID the ECU listens on for physical requests
    #[serde(default = "default_request_id")]
    pub request_id: u32,

    /// CAN ID the ECU transmits from
    #[serde(default = "default_response_id")]
    pub response_id: u32,

    /// Functional (broadcast) CAN ID the ECU also listens on
    #[serde(default = "default_functional_id")]
    pub functional_id: u32,

    #[serde(default)]
    pub can_type: CanType,

    /// Block size the ECU advertises when receiving multi-frame requests
    #[serde(default)]
    pub block_size: u8,

    /// Raw STmin the ECU advertises when receiving multi-frame requests
    #[serde(default)]
    pub st_min: u8,

    /// XOR seed/key secret as hex
    #[serde(default = "default_secret")]
    pub security_secret: String,

    /// NRC 0x78 replies sent before a RoutineControl result
    #[serde(default = "default_pending")]
    pub routine_pending_count: u32,

    /// Readable (and writable) data identifiers
    #[serde(default = "default_dids")]
    pub dids: Vec<DidConfig>,
}

fn default_name() -> String {
    "engine".to_string()
}

fn default_request_id() -> u32 {
    0x7E0
}

fn default_response_id() -> u32 {
    0x7E8
}

fn default_functional_id() -> u32 {
    0x7DF
}

fn default_secret() -> String {
    "a5a5".to_string()
}

fn default_pending() -> u32 {
    2
}

fn default_dids() -> Vec<DidConfig> {
    vec![
        DidConfig {
            did: 0xF190,
            ascii: Some("WF0XXXGCDX1234567".to_string()),
            hex: None,
        },
        DidConfig {
            did: 0xF187,
            ascii: Some("SIM-ECU-0001".to_string()),
            hex: None,
        },
    ]
}

impl Default for EcuConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            request_id: default_request_id(),
            response_id: default_response_id(),
            functional_id: default_functional_id(),
            can_type: CanType::default(),
            block_size: 0,
            st_min: 0,
            security_secret: default_secret(),
            routine_pending_count: default_pending(),
            dids: default_dids(),
        }
    }
}

impl EcuConfig {
    /// Decoded security secret
    pub fn security_key(&self) -> SimResult<Vec<u8>> {
        let key = hex::decode(self.security_secret.trim())?;
        if key.is_empty() {
            return Err(SimError::Config(format!(
                "ECU '{}' has an empty security secret",
                self.name
            )));
        }
        Ok(key)
    }
}

/// Initial value of one data identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidConfig {
    pub did: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ascii: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hex: Option<String>,
}

impl DidConfig {
    pub fn value(&self) -> SimResult<Vec<u8>> {
        match (&self.ascii, &self.hex) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(hex)) => Ok(hex::decode(hex.trim())?),
            _ => Err(SimError::Config(format!(
                "DID 0x{:04X} needs exactly one of 'ascii' or 'hex'",
                self.did
            ))),
        }
    }
}
