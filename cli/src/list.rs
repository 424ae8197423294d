use dfuse::{DfuDevice, Sector, list_dfu_devices};

use crate::CliError;

pub(crate) fn list_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = list_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices)?;
    }
    Ok(())
}

fn print_sector(prefix: &str, sector: &Sector) {
    let (size, unit) = if sector.len >= 1024 {
        (sector.len / 1024, "K")
    } else {
        (sector.len, " ")
    };
    println!(
        "{}alt {}: 0x{:08X} {:4}{} bytes ({}{}{}) {}",
        prefix,
        sector.alternate,
        sector.start,
        size,
        unit,
        if sector.mode.readable() { "r" } else { "" },
        if sector.mode.writable() { "w" } else { "" },
        if sector.mode.erasable() { "e" } else { "" },
        sector.name,
    );
}

fn print_devices(devices: &[DfuDevice]) -> Result<(), CliError> {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} serial {} (dfuse={})",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            device.serial_number().unwrap_or("?"),
            device.is_dfuse(),
        );
        for sector in device.sector_map()? {
            print_sector("    ", &sector);
        }
    }
    Ok(())
}
