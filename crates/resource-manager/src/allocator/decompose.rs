//! Address range to CIDR summarization
//!
//! Turns an inclusive `(low, high)` address pair into the minimal list of
//! aligned subnets that cover exactly that interval.

use super::interval_set::IntervalSet;
use crate::models::{Family, Range, Subnet};
use crate::{Error, Result};

/// Address interval covered by a subnet
pub fn subnet_range(subnet: &Subnet) -> Range<u128> {
    Range::new(subnet.first(), subnet.last())
}

/// Minimal set of subnets covering exactly `[low, high]`
///
/// Subnets are returned in address order.
pub fn decompose(family: Family, low: u128, high: u128) -> Result<Vec<Subnet>> {
    if low > high || high > family.max_value() {
        return Err(Error::InvalidRange(format!(
            "[{}, {}] is not a valid {:?} address range",
            low, high, family
        )));
    }
    let mut out = Vec::new();
    decompose_into(family, low, high, &mut out)?;
    Ok(out)
}

/// Decompose every range of an address interval set
pub fn decompose_set(family: Family, set: &IntervalSet<u128>) -> Result<Vec<Subnet>> {
    let mut out = Vec::new();
    for range in set.iter() {
        out.extend(decompose(family, range.start(), range.end())?);
    }
    Ok(out)
}

fn host_mask(host_bits: u8) -> u128 {
    match host_bits {
        128 => u128::MAX,
        bits => (1u128 << bits) - 1,
    }
}

fn decompose_into(family: Family, low: u128, high: u128, out: &mut Vec<Subnet>) -> Result<()> {
    let width = family.width();

    for prefix in (0..=width).rev() {
        let host_bits = width - prefix;
        let mask = host_mask(host_bits);
        let network = low & !mask;
        let last = network | mask;

        // Narrowest aligned block holding both ends
        if last < high {
            continue;
        }

        if network == low && last == high {
            out.push(Subnet::from_u128(family, low, prefix)?);
            return Ok(());
        }

        // low sits in the lower half and high in the upper one
        let upper_half = network | (1u128 << (host_bits - 1));
        decompose_into(family, low, upper_half - 1, out)?;
        decompose_into(family, upper_half, high, out)?;
        return Ok(());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::addr_to_u128;
    use std::net::IpAddr;

    fn v4(s: &str) -> u128 {
        addr_to_u128(s.parse::<IpAddr>().unwrap())
    }

    fn names(subnets: &[Subnet]) -> Vec<String> {
        subnets.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_block() {
        let out = decompose(Family::V4, v4("10.0.0.0"), v4("10.0.0.255")).unwrap();
        assert_eq!(names(&out), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_single_address() {
        let out = decompose(Family::V4, v4("10.0.0.7"), v4("10.0.0.7")).unwrap();
        assert_eq!(names(&out), vec!["10.0.0.7/32"]);
    }

    #[test]
    fn test_unaligned_range() {
        let out = decompose(Family::V4, v4("10.0.0.1"), v4("10.0.0.6")).unwrap();
        assert_eq!(
            names(&out),
            vec!["10.0.0.1/32", "10.0.0.2/31", "10.0.0.4/31", "10.0.0.6/32"]
        );
    }

    #[test]
    fn test_range_with_hole_punched() {
        // 10.0.0.0/24 minus 10.0.0.128/25 minus 10.0.0.5
        let out = decompose(Family::V4, v4("10.0.0.6"), v4("10.0.0.127")).unwrap();
        assert_eq!(
            names(&out),
            vec!["10.0.0.6/31", "10.0.0.8/29", "10.0.0.16/28", "10.0.0.32/27", "10.0.0.64/26"]
        );
    }

    #[test]
    fn test_full_domains() {
        let out = decompose(Family::V4, 0, u32::MAX as u128).unwrap();
        assert_eq!(names(&out), vec!["0.0.0.0/0"]);

        let out = decompose(Family::V6, 0, u128::MAX).unwrap();
        assert_eq!(names(&out), vec!["::/0"]);

        let out = decompose(Family::V6, 1, u128::MAX).unwrap();
        assert_eq!(out.len(), 128);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(decompose(Family::V4, 5, 4).is_err());
        assert!(decompose(Family::V4, 0, 1 << 32).is_err());
    }

    #[test]
    fn test_decompose_set() {
        let set: IntervalSet<u128> = vec![
            Range::new(v4("10.0.0.0"), v4("10.0.0.127")),
            Range::new(v4("10.0.1.0"), v4("10.0.1.3")),
        ]
        .into_iter()
        .collect();
        let out = decompose_set(Family::V4, &set).unwrap();
        assert_eq!(names(&out), vec!["10.0.0.0/25", "10.0.1.0/30"]);
    }
}
