use std::{
    thread,
    time::{Duration, Instant},
};

use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::error::DfuseError;
use crate::{DEFAULT_TIMEOUT, ERASE_BUDGET_DIVISOR};

pub(crate) const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DOWNLOAD: u8 = 1;
const DFU_CMD_UPLOAD: u8 = 2;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_ABORT: u8 = 6;

const DFU_STATUS_LEN: u16 = 6;

const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;
const DFUSE_CMD_ERASE: u8 = 0x41;

// wValue 0 and 1 are reserved for DfuSe commands, data blocks start at 2
const DFUSE_BLOCK_OFFSET: u16 = 2;

/// DFU device state (DFU 1.1, section 6.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    Idle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    Error,
    Other(u8),
}

impl DfuState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::Idle,
            3 => DfuState::DownloadSync,
            4 => DfuState::DownloadBusy,
            5 => DfuState::DownloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::Error,
            other => DfuState::Other(other),
        }
    }
}

/// Response to `DFU_GETSTATUS`: status code, poll-timeout hint
/// in milliseconds and the current state.
#[derive(Debug, Clone)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuStatus {
    fn from_raw(data: &[u8]) -> Result<Self, DfuseError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuseError::ShortStatus { len: data.len() });
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: DfuState::from_byte(data[4]),
        })
    }
}

/// Request/response primitive the driver runs on. Implemented for
/// [`nusb::Interface`]; tests provide a simulated device.
pub trait DfuTransport {
    fn class_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuseError>;

    fn class_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuseError>;

    fn select_setting(&self, alt_setting: u8) -> Result<(), DfuseError>;
}

impl DfuTransport for nusb::Interface {
    fn class_out(
        &self,
        request: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuseError> {
        let index = self.interface_number() as u16;
        Ok(self
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn class_in(
        &self,
        request: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuseError> {
        let index = self.interface_number() as u16;
        Ok(self
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn select_setting(&self, alt_setting: u8) -> Result<(), DfuseError> {
        Ok(self.set_alt_setting(alt_setting).wait()?)
    }
}

/// Driver for one DfuSe device. Issues strictly one request at a time and
/// confirms every state-changing request through `DFU_GETSTATUS`.
pub struct DfuseConnection<T> {
    transport: T,
    current_alt: Option<u8>,
}

impl<T: DfuTransport> DfuseConnection<T> {
    pub fn new(transport: T) -> Self {
        DfuseConnection {
            transport,
            current_alt: None,
        }
    }

    pub fn get_status(&self) -> Result<DfuStatus, DfuseError> {
        let data = self.transport.class_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuStatus::from_raw(&data)
    }

    pub fn clear_status(&self) -> Result<(), DfuseError> {
        self.transport.class_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    pub fn abort(&self) -> Result<(), DfuseError> {
        self.transport.class_out(DFU_CMD_ABORT, 0, &[])
    }

    fn dnload(&self, block: u16, data: &[u8]) -> Result<(), DfuseError> {
        self.transport.class_out(DFU_CMD_DOWNLOAD, block, data)
    }

    fn upload(&self, block: u16, length: u16) -> Result<Vec<u8>, DfuseError> {
        self.transport.class_in(DFU_CMD_UPLOAD, block, length)
    }

    /// Read status, and while the device reports `busy`, sleep for the
    /// poll-timeout hint and re-read. Returns the first status outside
    /// `busy`, or [`DfuseError::Timeout`] once `budget` elapses.
    pub fn wait_while_state(
        &self,
        busy: DfuState,
        budget: Duration,
    ) -> Result<DfuStatus, DfuseError> {
        let start = Instant::now();
        loop {
            let st = self.get_status()?;
            if st.state != busy {
                return Ok(st);
            }
            if start.elapsed() >= budget {
                return Err(DfuseError::Timeout { state: busy });
            }
            thread::sleep(Duration::from_millis(st.poll_timeout.max(1) as u64));
        }
    }

    fn transition(
        &self,
        busy: DfuState,
        required: DfuState,
        budget: Duration,
    ) -> Result<DfuStatus, DfuseError> {
        let st = self.wait_while_state(busy, budget)?;
        if st.state != required {
            return Err(DfuseError::UnexpectedState {
                expected: required,
                status: st,
            });
        }
        Ok(st)
    }

    /// Switch the interface to alternate setting `alt`. No-op when already
    /// selected. A device left in the error state is recovered by clearing
    /// status before anything else is issued.
    pub fn select_alternate(&mut self, alt: u8) -> Result<(), DfuseError> {
        if self.current_alt == Some(alt) {
            return Ok(());
        }
        self.transport.select_setting(alt)?;
        self.current_alt = Some(alt);
        if self.get_status()?.state == DfuState::Error {
            self.clear_status()?;
            self.wait_while_state(DfuState::Error, DEFAULT_TIMEOUT)?;
        }
        Ok(())
    }

    /// Commit the DfuSe address pointer. The pointer is set with a
    /// zero-block download and then the pending download is aborted,
    /// leaving the device in `Idle` with the pointer in place.
    pub fn set_address(&mut self, addr: u32) -> Result<(), DfuseError> {
        self.dnload(0, &dfuse_command(DFUSE_CMD_SET_ADDRESS, addr))?;
        self.transition(
            DfuState::DownloadBusy,
            DfuState::DownloadIdle,
            DEFAULT_TIMEOUT,
        )?;
        self.abort()?;
        self.transition(DfuState::DownloadSync, DfuState::Idle, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    /// Erase the page at `addr`. The wait budget scales with the sector
    /// length, since erase time is roughly proportional to it.
    pub fn erase_page(
        &mut self,
        addr: u32,
        sector_len: u32,
    ) -> Result<(), DfuseError> {
        self.dnload(0, &dfuse_command(DFUSE_CMD_ERASE, addr))?;
        let budget = Duration::from_millis(
            (sector_len as u64 / ERASE_BUDGET_DIVISOR).max(1),
        );
        self.transition(DfuState::DownloadBusy, DfuState::DownloadIdle, budget)?;
        Ok(())
    }

    /// Program one block at the current address pointer.
    pub fn write_block(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<(), DfuseError> {
        self.dnload(block + DFUSE_BLOCK_OFFSET, data)?;
        self.transition(
            DfuState::DownloadBusy,
            DfuState::DownloadIdle,
            DEFAULT_TIMEOUT,
        )?;
        Ok(())
    }

    /// Read one block back from the current address pointer.
    pub fn read_block(
        &self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuseError> {
        self.upload(block + DFUSE_BLOCK_OFFSET, length)
    }

    /// Leave DFU mode and run the application at `addr`. The device resets
    /// while manifesting, so losing it on the bus here is success.
    pub fn leave(&mut self, addr: u32) -> Result<(), DfuseError> {
        self.set_address(addr)?;
        match self.dnload(0, &[]) {
            Ok(()) => {}
            Err(DfuseError::Transfer(_)) => return Ok(()),
            Err(err) => return Err(err),
        }
        match self.wait_while_state(DfuState::ManifestSync, DEFAULT_TIMEOUT) {
            Ok(st) if st.state == DfuState::Manifest => Ok(()),
            Ok(st) => Err(DfuseError::UnexpectedState {
                expected: DfuState::Manifest,
                status: st,
            }),
            Err(DfuseError::Transfer(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn dfuse_command(cmd: u8, addr: u32) -> [u8; 5] {
    [
        cmd,
        addr as u8,
        (addr >> 8) as u8,
        (addr >> 16) as u8,
        (addr >> 24) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_byte_roundtrip() {
        assert_eq!(DfuState::from_byte(2), DfuState::Idle);
        assert_eq!(DfuState::from_byte(4), DfuState::DownloadBusy);
        assert_eq!(DfuState::from_byte(10), DfuState::Error);
        assert_eq!(DfuState::from_byte(42), DfuState::Other(42));
    }

    #[test]
    fn status_from_raw() {
        let st = DfuStatus::from_raw(&[0, 0x10, 0x02, 0x00, 5, 0]).unwrap();
        assert_eq!(st.status, 0);
        assert_eq!(st.poll_timeout, 0x0210);
        assert_eq!(st.state, DfuState::DownloadIdle);

        assert!(matches!(
            DfuStatus::from_raw(&[0, 0, 0]),
            Err(DfuseError::ShortStatus { len: 3 })
        ));
    }

    #[test]
    fn dfuse_command_is_little_endian() {
        assert_eq!(
            dfuse_command(DFUSE_CMD_SET_ADDRESS, 0x0800_4000),
            [0x21, 0x00, 0x40, 0x00, 0x08]
        );
    }
}
