use crate::connection::{DfuState, DfuStatus};

#[derive(Debug)]
pub enum DfuseError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    /// A state-changing request ended in a state other than the required one.
    UnexpectedState {
        expected: DfuState,
        status: DfuStatus,
    },
    /// The device stayed busy past the operation's wait budget.
    Timeout {
        state: DfuState,
    },
    ShortStatus {
        len: usize,
    },
    /// Malformed alternate-setting descriptor string. Fatal: a wrong address
    /// map risks writing to the wrong flash region.
    Descriptor(String),
    InvalidUuid(String),
    /// Readback differs from the programmed payload. `expected`/`observed`
    /// hold the 16-byte window starting at `address`.
    Verify {
        address: u32,
        expected: Vec<u8>,
        observed: Vec<u8>,
    },
    VerifyLength {
        expected: usize,
        observed: usize,
    },
    /// The matched application device has no way to enter DFU mode.
    IncompatibleFirmware {
        serial: String,
    },
    Aborted,
}

impl std::error::Error for DfuseError {}

impl std::fmt::Display for DfuseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuseError::Usb(err) => write!(f, "USB error: {}", err),
            DfuseError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuseError::UnexpectedState { expected, status } => {
                write!(
                    f,
                    "Device did not reach {:?}. Device status: {:?}",
                    expected, status
                )
            }
            DfuseError::Timeout { state } => {
                write!(f, "Timed out waiting for device to leave {:?}", state)
            }
            DfuseError::ShortStatus { len } => {
                write!(f, "Truncated DFU status response ({} bytes)", len)
            }
            DfuseError::Descriptor(s) => {
                write!(f, "Malformed memory layout descriptor: {}", s)
            }
            DfuseError::InvalidUuid(s) => {
                write!(f, "Invalid device UUID: {}", s)
            }
            DfuseError::Verify {
                address,
                expected,
                observed,
            } => {
                write!(
                    f,
                    "Verification failed around address {:#010x}:\n  expected: {}\n  observed: {}",
                    address,
                    hex_window(expected),
                    hex_window(observed)
                )
            }
            DfuseError::VerifyLength { expected, observed } => {
                write!(
                    f,
                    "Readback length {} does not match payload length {}",
                    observed, expected
                )
            }
            DfuseError::IncompatibleFirmware { serial } => {
                write!(
                    f,
                    "Firmware on device {} does not support DFU",
                    serial
                )
            }
            DfuseError::Aborted => write!(f, "Aborted"),
        }
    }
}

fn hex_window(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl From<nusb::Error> for DfuseError {
    fn from(err: nusb::Error) -> Self {
        DfuseError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuseError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuseError::Transfer(err)
    }
}
