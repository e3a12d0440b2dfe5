//! Host-side serial port discovery.

use crate::error::{Error, Result};
use crate::port::native::list_ports as native_list_ports;
use crate::port::PortInfo;

/// List all available serial ports.
pub fn discover_ports() -> Result<Vec<PortInfo>> {
    native_list_ports()
}

/// Pick a serial port: the first one matching `pattern` as a substring, or
/// the first available port when no pattern is given.
pub fn find_port(pattern: Option<&str>) -> Result<String> {
    let ports = discover_ports()?;

    match pattern {
        Some(p) => ports
            .into_iter()
            .map(|info| info.name)
            .find(|name| name.contains(p))
            .ok_or_else(|| Error::Config(format!("no serial port matches '{p}'"))),
        None => ports
            .into_iter()
            .next()
            .map(|info| info.name)
            .ok_or_else(|| Error::Config("no serial ports available".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_ports_does_not_panic() {
        let _ = discover_ports();
    }

    #[test]
    fn test_find_port_with_unmatchable_pattern() {
        let result = find_port(Some("definitely-not-a-real-port-name"));
        assert!(result.is_err());
    }
}
