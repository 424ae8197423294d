use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;

use error::CliError;
use flash::*;
use list::*;

mod error;
mod flash;
mod list;

// STM32 bootloader in DFU mode
const DFU_VENDOR_ID: u16 = 0x0483;
const DFU_PRODUCT_ID: u16 = 0xdf11;

// device running application firmware
const APP_VENDOR_ID: u16 = 0x1209;
const APP_PRODUCT_ID: u16 = 0x0d32;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices and their sector maps
    List {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// flash a raw firmware binary and jump into it
    Flash {
        /// firmware binary
        file: PathBuf,
        /// load address (ex: 0x08000000)
        #[clap(short, long, value_parser=maybe_hex::<u32>, default_value_t = 0x0800_0000)]
        address: u32,
        /// application entry point jumped to after flashing
        #[clap(short, long, value_parser=maybe_hex::<u32>, default_value_t = 0x0800_0000)]
        entry: u32,
        /// 12-digit serial number of the unit to flash (ex: 385F324D3037)
        #[clap(short, long, conflicts_with = "uuid")]
        serial_number: Option<String>,
        /// 12-byte unit UUID (ex: 385F324D-30371234-ABCD0001)
        #[clap(short, long)]
        uuid: Option<String>,
        /// print the sector map and the sectors to be flashed
        #[clap(short, long)]
        verbose: bool,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => list_devices(vendor, product),
        Commands::Flash {
            file,
            address,
            entry,
            serial_number,
            uuid,
            verbose,
        } => flash_firmware(&file, address, entry, serial_number, uuid, verbose),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
