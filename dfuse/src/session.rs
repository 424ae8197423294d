use std::fmt;

use crate::cancel::CancelToken;
use crate::error::DfuseError;

/// Everything a discovery or protocol call needs from the surrounding run:
/// the optional unit filter and the whole-program cancellation signal.
/// Threaded explicitly instead of living in globals.
#[derive(Clone, Default)]
pub struct SessionContext {
    pub serial: Option<String>,
    pub cancel: CancelToken,
}

impl SessionContext {
    pub fn new(serial: Option<String>) -> Self {
        SessionContext {
            serial,
            cancel: CancelToken::new(),
        }
    }
}

/// 12-byte device UUID, three big-endian 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceUuid([u32; 3]);

impl DeviceUuid {
    /// Parse `"XXXXXXXX-XXXXXXXX-XXXXXXXX"` (dashes optional).
    pub fn parse(s: &str) -> Result<Self, DfuseError> {
        let hex: String = s.chars().filter(|&c| c != '-').collect();
        if hex.len() != 24 {
            return Err(DfuseError::InvalidUuid(s.to_string()));
        }
        let mut words = [0u32; 3];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16)
                .map_err(|_| DfuseError::InvalidUuid(s.to_string()))?;
        }
        Ok(DeviceUuid(words))
    }

    /// The 12-digit serial the device derives from its UUID: the first four
    /// bytes of `word0 + word2` (big-endian) followed by the top two bytes
    /// of `word1`, hex uppercase.
    pub fn to_serial(&self) -> String {
        let [w0, w1, w2] = self.0;
        format!("{:08X}{:04X}", w0.wrapping_add(w2), (w1 >> 16) as u16)
    }
}

impl fmt::Display for DeviceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [w0, w1, w2] = self.0;
        write!(f, "{:08X}-{:08X}-{:08X}", w0, w1, w2)
    }
}
