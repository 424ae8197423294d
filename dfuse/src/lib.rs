//! USB Device Firmware Upgrade (DFU) flashing engine based on [`nusb`]
//!
//! Implements the DfuSe (STM32 extension) side of the DFU protocol: sector
//! map discovery from alternate-setting layout strings, selection of the
//! sectors an image actually touches, and the erase/program/verify state
//! machine with its timeouts and error recovery. A discovery orchestrator
//! finds a device already in DFU mode while rebooting application-mode
//! devices into the bootloader.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! Flashing waits for a bootloader, maps its flash and programs only the
//! touched sectors:
//! ```no_run
//! use dfuse::{
//!     POLL_INTERVAL, SessionContext, SparseImage, UsbId, UsbScanner,
//!     flasher, select_targets, wait_for_bootloader,
//! };
//!
//! # fn main() -> Result<(), dfuse::DfuseError> {
//! let scanner = UsbScanner {
//!     dfu_id: UsbId { vendor: 0x0483, product: 0xdf11 },
//!     app_id: UsbId { vendor: 0x1209, product: 0x0d32 },
//! };
//! let ctx = SessionContext::new(None);
//! let device = wait_for_bootloader(&scanner, &ctx, POLL_INTERVAL)?;
//!
//! let image = SparseImage::from_binary(0x0800_0000, vec![0u8; 1024]);
//! let targets = select_targets(&device.sector_map()?, &image);
//! let mut conn = device.connect()?;
//! flasher::program_device(
//!     &mut conn,
//!     &targets,
//!     device.transfer_size() as u32,
//!     &mut |_, _, _| {},
//! )?;
//! conn.leave(0x0800_0000)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

use std::time::Duration;

/// Wait budget for address-set, write and erase-completion polls.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);

/// Largest per-transaction payload this engine will use, matching the
/// STM32 bootloader's transfer size.
pub const MAX_TRANSFER_SIZE: u16 = 1024 * 2;

/// Erase wait budget is `sector_length / ERASE_BUDGET_DIVISOR` milliseconds.
/// Empirically chosen upper bound, not a measured erase throughput.
pub(crate) const ERASE_BUDGET_DIVISOR: u64 = 32;

mod cancel;
mod connection;
mod descriptor;
mod device;
mod discovery;
mod error;
pub mod flasher;
mod image;
mod sector;
mod session;
mod target;

// Re-exports
pub use cancel::{CancelToken, spawn_deferred_notice};
pub use connection::{DfuState, DfuStatus, DfuTransport, DfuseConnection};
pub use descriptor::{DFUSE_VERSION_NUMBER, DfuDescriptor};
pub use device::{DfuDevice, UsbId, UsbRuntimeDevice, UsbScanner, list_dfu_devices};
pub use discovery::{
    AppDevice, DeviceScanner, POLL_INTERVAL, RuntimeDevice, wait_for_bootloader,
};
pub use error::DfuseError;
pub use flasher::{FlashPhase, program_device};
pub use image::{FILL_BYTE, FirmwareImage, SparseImage};
pub use sector::{Sector, SectorMode, build_sector_map, parse_region};
pub use session::{DeviceUuid, SessionContext};
pub use target::{TargetEntry, select_targets};
