pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

/// `bcdDFUVersion` reported by DfuSe (ST extension) bootloaders.
pub const DFUSE_VERSION_NUMBER: u16 = 0x11A;

/// DFU functional descriptor (DFU 1.1, section 4.1.3), as attached to both
/// runtime and DFU-mode interfaces.
#[derive(Debug, Default)]
pub struct DfuDescriptor {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuDescriptor {
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub(crate) fn new(raw_desc: &[u8]) -> Self {
        Self {
            attributes: raw_desc[2],
            detach_timeout: (raw_desc[4] as u16) << 8 | (raw_desc[3] as u16),
            transfer_size: (raw_desc[6] as u16) << 8 | (raw_desc[5] as u16),
            dfu_version: (raw_desc[8] as u16) << 8 | (raw_desc[7] as u16),
        }
    }

    /// Device detaches itself on `DFU_DETACH`; no USB reset needed
    /// (`bitWillDetach`).
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Longest wait the device allows between `DFU_DETACH` and reset, in
    /// milliseconds (`wDetachTimeOut`).
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Bytes the device accepts per control-write transaction
    /// (`wTransferSize`).
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// DFU specification release (`bcdDFUVersion`).
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }

    pub fn is_dfuse(&self) -> bool {
        self.dfu_version == DFUSE_VERSION_NUMBER
    }
}
