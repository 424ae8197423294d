use std::{num::NonZeroU8, time::Duration};

use log::debug;
use nusb::{self, MaybeFuture};

use crate::DEFAULT_TIMEOUT;
use crate::connection::{DFU_CMD_DETACH, DfuTransport, DfuseConnection};
use crate::descriptor::{DFU_DESC_LEN, DFU_DESC_TYPE, DfuDescriptor};
use crate::discovery::{AppDevice, DeviceScanner, RuntimeDevice};
use crate::error::DfuseError;
use crate::sector::{Sector, build_sector_map};

const DFU_CLASS: u8 = 0xFE;
const DFU_SUBCLASS: u8 = 0x1;

/// Fixed USB identity (vendor/product pair) of one transport persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

fn matches_filter(
    dev: &nusb::DeviceInfo,
    id: UsbId,
    serial: Option<&str>,
) -> bool {
    dev.vendor_id() == id.vendor
        && dev.product_id() == id.product
        && serial.is_none_or(|s| dev.serial_number() == Some(s))
}

/// A device enumerated in DFU mode: the flashing target.
///
/// Alternate-setting names are read once at discovery; the sector map is
/// parsed from them on demand.
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    interface: u8,
    alternates: Vec<(u8, String)>,
    descriptor: DfuDescriptor,
}

impl DfuDevice {
    fn from_device_info(
        dev: nusb::DeviceInfo,
    ) -> Result<Option<Self>, DfuseError> {
        let open_dev: nusb::Device = dev.open().wait()?;

        let mut interface: Option<u8> = None;
        let mut alternates = Vec::new();
        for config in open_dev.configurations() {
            for alt in config.interface_alt_settings() {
                if alt.class() != DFU_CLASS || alt.subclass() != DFU_SUBCLASS {
                    continue;
                }
                let intf = *interface.get_or_insert(alt.interface_number());
                if intf != alt.interface_number() {
                    continue;
                }
                let Some(idx) = alt.string_index() else {
                    continue;
                };
                if let Some(name) =
                    get_string_descriptor(&open_dev, idx, DEFAULT_TIMEOUT)
                {
                    alternates.push((alt.alternate_setting(), name));
                }
            }
        }

        let descriptor = find_dfu_descriptor(&open_dev).unwrap_or_default();
        match interface {
            Some(interface) if !alternates.is_empty() => Ok(Some(DfuDevice {
                dev,
                interface,
                alternates,
                descriptor,
            })),
            _ => Ok(None),
        }
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.dev.serial_number()
    }

    pub fn is_dfuse(&self) -> bool {
        self.descriptor.is_dfuse()
    }

    /// Per-transaction transfer limit, clamped to what this engine uses.
    pub fn transfer_size(&self) -> u16 {
        match self.descriptor.transfer_size() {
            0 => crate::MAX_TRANSFER_SIZE,
            size => size.min(crate::MAX_TRANSFER_SIZE),
        }
    }

    /// Parse every alternate setting's layout string into the flat sector
    /// map, in discovery order.
    pub fn sector_map(&self) -> Result<Vec<Sector>, DfuseError> {
        build_sector_map(
            self.alternates
                .iter()
                .map(|(alt, name)| (*alt, name.as_str())),
        )
    }

    /// Claim the DFU interface and hand it to the protocol driver.
    pub fn connect(
        &self,
    ) -> Result<DfuseConnection<nusb::Interface>, DfuseError> {
        let dev = self.dev.open().wait()?;
        let interface = dev.claim_interface(self.interface).wait()?;
        Ok(DfuseConnection::new(interface))
    }
}

/// A matched application-mode device whose firmware can detach into the
/// bootloader.
pub struct UsbRuntimeDevice {
    dev: nusb::DeviceInfo,
    interface: u8,
    serial: String,
    descriptor: DfuDescriptor,
}

impl RuntimeDevice for UsbRuntimeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn enter_dfu_mode(&self) -> Result<(), DfuseError> {
        let dev = self.dev.open().wait()?;
        let interface = dev.claim_interface(self.interface).wait()?;
        // The device drops off the bus as it reboots, so the request itself
        // failing is the expected outcome.
        if let Err(err) = interface.class_out(
            DFU_CMD_DETACH,
            self.descriptor.detach_timeout(),
            &[],
        ) {
            debug!("detach request ended with {err} (device rebooting)");
        }
        if !self.descriptor.will_detach() {
            debug!("device {} expects a USB reset to detach", self.serial);
        }
        Ok(())
    }
}

/// [`DeviceScanner`] over the host's USB buses, matching the bootloader and
/// application personas by their fixed identities.
pub struct UsbScanner {
    pub dfu_id: UsbId,
    pub app_id: UsbId,
}

impl DeviceScanner for UsbScanner {
    type Target = DfuDevice;
    type Runtime = UsbRuntimeDevice;

    fn find_target(
        &self,
        serial: Option<&str>,
    ) -> Result<Option<DfuDevice>, DfuseError> {
        for dev in nusb::list_devices()
            .wait()?
            .filter(|dev| matches_filter(dev, self.dfu_id, serial))
        {
            if let Some(dfu) = DfuDevice::from_device_info(dev)? {
                return Ok(Some(dfu));
            }
        }
        Ok(None)
    }

    fn find_runtime(
        &self,
        serial: Option<&str>,
    ) -> Result<Option<AppDevice<UsbRuntimeDevice>>, DfuseError> {
        let Some(dev) = nusb::list_devices()
            .wait()?
            .find(|dev| matches_filter(dev, self.app_id, serial))
        else {
            return Ok(None);
        };

        let serial = dev.serial_number().unwrap_or("<unknown>").to_string();
        // Classified once here: either the firmware carries a runtime DFU
        // interface or it never will until reflashed another way.
        Ok(Some(match find_runtime_dfu_interface(&dev)? {
            Some((interface, descriptor)) => {
                AppDevice::DfuCapable(UsbRuntimeDevice {
                    dev,
                    interface,
                    serial,
                    descriptor,
                })
            }
            None => AppDevice::Legacy { serial },
        }))
    }
}

/// All DFU-mode devices visible right now, optionally narrowed by
/// vendor/product id.
pub fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuseError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(|dev| {
            dev.interfaces()
                .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
        })
        .collect();

    let mut dfu_devices = Vec::with_capacity(devices.len());
    for device in devices {
        if let Some(dfu_device) = DfuDevice::from_device_info(device)? {
            dfu_devices.push(dfu_device);
        }
    }
    Ok(dfu_devices)
}

fn find_runtime_dfu_interface(
    dev: &nusb::DeviceInfo,
) -> Result<Option<(u8, DfuDescriptor)>, DfuseError> {
    let open_dev = dev.open().wait()?;
    let interface = open_dev.configurations().find_map(|config| {
        config.interface_alt_settings().find_map(|alt| {
            (alt.class() == DFU_CLASS && alt.subclass() == DFU_SUBCLASS)
                .then(|| alt.interface_number())
        })
    });
    Ok(interface.map(|interface| {
        (interface, find_dfu_descriptor(&open_dev).unwrap_or_default())
    }))
}

fn find_dfu_descriptor(dev: &nusb::Device) -> Option<DfuDescriptor> {
    dev.configurations()
        .find_map(|config| {
            config.interface_alt_settings().find_map(|alt| {
                alt.descriptors().find(|desc| {
                    desc.descriptor_len() == DFU_DESC_LEN
                        && desc.descriptor_type() == DFU_DESC_TYPE
                })
            })
        })
        .map(|desc| DfuDescriptor::new(&desc))
}

fn get_string_descriptor(
    device: &nusb::Device,
    desc_index: NonZeroU8,
    timeout: Duration,
) -> Option<String> {
    let language: u16 = device
        .get_string_descriptor_supported_languages(timeout)
        .wait()
        .ok()?
        .next()
        .unwrap_or(nusb::descriptors::language_id::US_ENGLISH);

    device
        .get_string_descriptor(desc_index, language, timeout)
        .wait()
        .ok()
}
