use std::{fmt::Display, io};

use dfuse::DfuseError;

pub enum CliError {
    IO(io::Error),
    Dfu(DfuseError),
    Ctrlc(ctrlc::Error),
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuseError> for CliError {
    fn from(value: DfuseError) -> Self {
        CliError::Dfu(value)
    }
}

impl From<ctrlc::Error> for CliError {
    fn from(value: ctrlc::Error) -> Self {
        CliError::Ctrlc(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => write!(f, "{err}"),
            CliError::Ctrlc(err) => write!(f, "Signal handler error: {err}"),
        }
    }
}
