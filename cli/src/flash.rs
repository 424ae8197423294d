use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use dfuse::{
    DeviceUuid, FlashPhase, POLL_INTERVAL, SessionContext, SparseImage, UsbId,
    UsbScanner, program_device, select_targets, wait_for_bootloader,
};

use crate::{
    APP_PRODUCT_ID, APP_VENDOR_ID, CliError, DFU_PRODUCT_ID, DFU_VENDOR_ID,
};

pub(crate) fn flash_firmware(
    file: &Path,
    address: u32,
    entry: u32,
    serial_number: Option<String>,
    uuid: Option<String>,
    verbose: bool,
) -> Result<(), CliError> {
    let serial = match (uuid, serial_number) {
        (Some(uuid), _) => Some(DeviceUuid::parse(&uuid)?.to_serial()),
        (None, serial_number) => serial_number,
    };

    let image = SparseImage::from_binary(address, fs::read(file)?);

    let ctx = SessionContext::new(serial);
    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || cancel.cancel())?;

    let scanner = UsbScanner {
        dfu_id: UsbId {
            vendor: DFU_VENDOR_ID,
            product: DFU_PRODUCT_ID,
        },
        app_id: UsbId {
            vendor: APP_VENDOR_ID,
            product: APP_PRODUCT_ID,
        },
    };

    println!("Waiting for device...");
    let device = wait_for_bootloader(&scanner, &ctx, POLL_INTERVAL)?;
    println!(
        "Found device {} in DFU mode",
        device.serial_number().unwrap_or("<unknown>")
    );

    let sectors = device.sector_map()?;
    if verbose {
        println!("Sectors on device:");
        for sector in &sectors {
            println!(
                "  {:08X} to {:08X} ({})",
                sector.start,
                sector.end() - 1,
                sector.name
            );
        }
    }

    let targets = select_targets(&sectors, &image);
    if targets.is_empty() {
        println!("Image touches no sectors, nothing to do");
        return Ok(());
    }
    if verbose {
        println!("The following sectors will be flashed:");
        for target in &targets {
            println!(
                "  {:08X} to {:08X}",
                target.sector.start,
                target.sector.end() - 1
            );
        }
    }

    let mut conn = device.connect()?;
    program_device(
        &mut conn,
        &targets,
        device.transfer_size() as u32,
        &mut print_progress,
    )?;

    println!("Jumping to application...");
    conn.leave(entry)?;
    Ok(())
}

fn print_progress(phase: FlashPhase, done: usize, total: usize) {
    let label = match phase {
        FlashPhase::Erase => "Erasing",
        FlashPhase::Program => "Flashing",
        FlashPhase::Verify => "Verifying",
    };
    if done < total {
        print!("\r{}... (sector {}/{})  ", label, done, total);
    } else {
        println!("\r{}... done            ", label);
    }
    let _ = io::stdout().flush();
}
