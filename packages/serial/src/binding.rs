use crate::error::Result;
use std::str::FromStr;

/// The byte-oriented transport below the framer. Implemented outside of the
/// driver by the actual serial port or TCP socket.
pub trait SerialBinding: Send + 'static {
    /// Opens (or re-opens) the transport
    fn open(&mut self) -> Result<()>;

    /// Writes the given bytes to the transport
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Reads available bytes into the buffer. Ok(0) means no data was
    /// available; a disconnect surfaces as [crate::error::Error::PortClosed].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Closes the transport. Further reads and writes fail.
    fn close(&mut self) -> Result<()>;
}

/// Where to reach the controller: a local serial device or a TCP bridge
/// using the same framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialPath {
    Device(String),
    Tcp { host: String, port: u16 },
}

impl FromStr for SerialPath {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("invalid TCP path: {}", s))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid TCP port in: {}", s))?;
            return Ok(SerialPath::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Ok(SerialPath::Device(s.to_string()))
    }
}

impl std::fmt::Display for SerialPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SerialPath::Device(path) => write!(f, "{}", path),
            SerialPath::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_device_path() {
        assert_eq!(
            "/dev/ttyUSB0".parse(),
            Ok(SerialPath::Device("/dev/ttyUSB0".to_string()))
        );
    }

    #[test]
    fn test_parse_tcp_path() {
        assert_eq!(
            "tcp://zwave.local:4001".parse(),
            Ok(SerialPath::Tcp {
                host: "zwave.local".to_string(),
                port: 4001
            })
        );
        assert!("tcp://noport".parse::<SerialPath>().is_err());
    }
}
