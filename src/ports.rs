use std::collections::BTreeSet;

use log::{info, warn};

use crate::error::{Error, Result};

/// Parses a comma separated list of UDP ports such as `5401,5402`.
pub fn parse_port_list(list: &str) -> Result<Vec<u16>> {
    let ports = list
        .split(',')
        .map(str::trim)
        .filter(|port| !port.is_empty())
        .map(|port| {
            port.parse::<u16>()
                .map_err(|_| Error::InvalidPortList(list.to_string()))
        })
        .collect::<Result<Vec<u16>>>()?;
    if ports.is_empty() {
        return Err(Error::InvalidPortList(list.to_string()));
    }
    Ok(ports)
}

/// Free UDP ports for file-save workers. Each active recording holds one.
#[derive(Debug, Clone)]
pub struct UdpPortPool {
    known: BTreeSet<u16>,
    free: BTreeSet<u16>,
}

impl UdpPortPool {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let known: BTreeSet<u16> = ports.into_iter().collect();
        Self {
            free: known.clone(),
            known,
        }
    }

    pub fn allocate(&mut self) -> Result<u16> {
        let port = self.free.pop_first().ok_or(Error::NoFreePort)?;
        info!("Allocating UDP port: {}", port);
        Ok(port)
    }

    /// Returns `port` to the pool. Releasing a port twice, or one that never
    /// belonged to the pool, has no effect.
    pub fn release(&mut self, port: u16) -> bool {
        if !self.known.contains(&port) {
            warn!("Ignoring release of unknown UDP port: {}", port);
            return false;
        }
        if !self.free.insert(port) {
            warn!("UDP port {} was already free", port);
            return false;
        }
        info!("Releasing UDP port: {}", port);
        true
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Every port, free or not.
    pub fn all(&self) -> impl Iterator<Item = u16> + '_ {
        self.known.iter().copied()
    }
}
