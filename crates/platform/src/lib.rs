#![forbid(unsafe_code)]

pub mod interrupts;
pub mod memory;
pub mod reset;
