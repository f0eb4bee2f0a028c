//! Device firmware update for Nordic nRF5x bootloaders over a serial link.

pub mod dfu;
pub mod settings;

#[cfg(test)]
mod test_helpers;
