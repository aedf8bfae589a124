//! Value types shared by the pools

mod allocation;
mod range;
mod subnet;

pub use allocation::{Allocation, Consumer};
pub use range::{Range, Scalar};
pub use subnet::{addr_to_u128, u128_to_addr, Family, Subnet};
