use thiserror::Error;
use zwh_core::parse::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Parser error: {0}")]
    Parser(#[from] ParseError),
    #[error("The serial port is closed")]
    PortClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
