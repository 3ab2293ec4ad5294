//! Debug network walk
//!
//! Every module on the debug network describes its own counters with a
//! list of `(offset, description)` entries starting at address 0. The walk
//! reads a module's whole list before reading any counter, then reads the
//! counters in list order: the first entries are usually freeze registers
//! whose read side effect latches the counters that follow.
//!
//! Counters wider than 32 bits appear as two consecutive entries with the
//! same description; the second supplies the high word.

use crate::error::{DlaError, Result};
use crate::transport::Transport;
use dla_chip::{csr, debug_net};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Counter values by description
pub type DebugNetworkData = BTreeMap<String, u64>;

/// Issue one debug-network read
///
/// Returns `None` if the request address does not read back or the
/// response never becomes valid.
///
/// # Errors
///
/// Propagates CSR access failures.
pub fn read_debug_csr(
    transport: &dyn Transport,
    instance: usize,
    module: u32,
    address: u32,
) -> Result<Option<u32>> {
    let request = debug_net::request(module, address);
    transport.write_csr(instance, csr::DEBUG_NETWORK_ADDR, request)?;
    if transport.read_csr(instance, csr::DEBUG_NETWORK_ADDR)? != request {
        trace!("debug network: request {request:#x} did not read back");
        return Ok(None);
    }

    let mut valid = transport.read_csr(instance, csr::DEBUG_NETWORK_VALID)?;
    let mut retries = debug_net::VALID_RETRIES;
    while valid == 0 && retries > 0 {
        retries -= 1;
        valid = transport.read_csr(instance, csr::DEBUG_NETWORK_VALID)?;
    }
    if valid == 0 {
        return Ok(None);
    }
    Ok(Some(transport.read_csr(instance, csr::DEBUG_NETWORK_DATA)?))
}

/// Walk every module and collect its counters
///
/// Descriptions starting with `_` are read (for their side effect) but not
/// reported.
///
/// # Errors
///
/// Returns [`DlaError::DebugNetwork`] if a read fails inside a module that
/// has already answered, a description appears more than twice, a repeated
/// description is not at the next word, or a module lists an address twice.
pub fn read_debug_network(transport: &dyn Transport, instance: usize) -> Result<DebugNetworkData> {
    let mut result = DebugNetworkData::new();
    // description -> (occurrences, module, last address)
    let mut seen: HashMap<String, (u32, u32, u32)> = HashMap::new();

    for module in 0..debug_net::MAX_MODULES {
        let entries = read_module_list(transport, instance, module)?;
        if entries.is_empty() {
            continue;
        }
        debug!("debug network: module {module} lists {} counters", entries.len());

        for (i, (address, description)) in entries.iter().enumerate() {
            let address = *address;
            let value = read_debug_csr(transport, instance, module, address)?
                .ok_or_else(|| read_failure(instance, module, address))?;

            if entries[..i].iter().any(|(a, _)| *a == address) {
                return Err(DlaError::debug_network(format!(
                    "module {module} lists counter address {address:#x} twice"
                )));
            }

            let high_word = match seen.get_mut(description) {
                None => {
                    seen.insert(description.clone(), (1, module, address));
                    false
                }
                Some((count, _, _)) if *count >= 2 => {
                    return Err(DlaError::debug_network(format!(
                        "more than two counters are named {description:?}"
                    )));
                }
                Some((count, prev_module, prev_address)) => {
                    if *prev_module != module || prev_address.wrapping_add(4) != address {
                        return Err(DlaError::debug_network(format!(
                            "counters named {description:?} are not at consecutive addresses"
                        )));
                    }
                    *count += 1;
                    true
                }
            };

            if description.starts_with(debug_net::HIDDEN_PREFIX) {
                continue;
            }
            if high_word {
                *result.entry(description.clone()).or_default() |= u64::from(value) << 32;
            } else {
                result.insert(description.clone(), u64::from(value));
            }
        }
    }
    Ok(result)
}

/// Read one module's `(offset, description)` list
///
/// An empty list means the module is absent.
fn read_module_list(
    transport: &dyn Transport,
    instance: usize,
    module: u32,
) -> Result<Vec<(u32, String)>> {
    let mut entries = Vec::new();
    let mut address = 0u32;

    loop {
        let Some(offset) = read_debug_csr(transport, instance, module, address)? else {
            if entries.is_empty() {
                return Ok(entries);
            }
            return Err(read_failure(instance, module, address));
        };
        if offset == 0 {
            return Ok(entries);
        }
        address += 4;

        let mut bytes = Vec::new();
        let mut words = 0;
        'description: loop {
            if words == debug_net::MAX_DESCRIPTION_WORDS {
                return Err(DlaError::debug_network(format!(
                    "module {module}: description at {address:#x} is not terminated"
                )));
            }
            let word = read_debug_csr(transport, instance, module, address)?
                .ok_or_else(|| read_failure(instance, module, address))?;
            address += 4;
            words += 1;
            for b in word.to_le_bytes() {
                if b == 0 {
                    break 'description;
                }
                bytes.push(b);
            }
        }
        entries.push((offset, String::from_utf8_lossy(&bytes).into_owned()));
    }
}

fn read_failure(instance: usize, module: u32, address: u32) -> DlaError {
    DlaError::debug_network(format!(
        "instance {instance}: read failed at module {module} address {address:#x}"
    ))
}
