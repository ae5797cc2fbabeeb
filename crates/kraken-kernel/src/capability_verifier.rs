//! Tamper detection for service permission masks.
//!
//! At registration the registry stores [`compute_checksum`] of the service's
//! name and [`Permissions`]. Every permission query calls [`verify`] first;
//! a mismatch means the stored mask or name changed outside the
//! registration path and the query must be denied.
//!
//! The checksum is FNV-1a over the name, then the mask, then a fixed
//! constant, with a final multiply. It detects corruption and naive
//! tampering; it is not a MAC and makes no claim to resist a forger who
//! knows the scheme.
//!
//! # Example
//!
//! ```
//! use kraken_kernel::capability_verifier::{compute_checksum, verify};
//! use kraken_types::Permissions;
//!
//! let sum = compute_checksum("wifi", Permissions::WIFI | Permissions::NETWORK);
//! assert!(verify("wifi", Permissions::WIFI | Permissions::NETWORK, sum).is_ok());
//! assert!(verify("wifi", Permissions::ALL, sum).is_err());
//! ```

use kraken_types::{KernelError, Permissions};
use tracing::error;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;
const CHECKSUM_SECRET: u32 = 0xDEAD_BEEF;

/// Checksum binding `name` to `permissions`. Deterministic across runs.
pub fn compute_checksum(name: &str, permissions: Permissions) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= permissions.bits();
    hash = hash.wrapping_mul(FNV_PRIME);

    hash ^= CHECKSUM_SECRET;
    hash.wrapping_mul(FNV_PRIME)
}

/// Recompute the checksum and compare it with the `stored` one.
///
/// # Errors
///
/// [`KernelError::SecurityViolation`] on mismatch, logged at `error` level.
/// Callers must treat it as a denial.
pub fn verify(name: &str, permissions: Permissions, stored: u32) -> Result<(), KernelError> {
    let expected = compute_checksum(name, permissions);
    if expected == stored {
        return Ok(());
    }
    error!(
        service = name,
        expected = format_args!("{expected:#010x}"),
        stored = format_args!("{stored:#010x}"),
        "SECURITY: permission tampering detected"
    );
    Err(KernelError::SecurityViolation(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let perms = Permissions::DISPLAY | Permissions::AUDIO;
        assert_eq!(compute_checksum("display", perms), compute_checksum("display", perms));
    }

    #[test]
    fn matching_checksum_verifies() {
        let perms = Permissions::BLUETOOTH;
        let sum = compute_checksum("bluetooth", perms);
        assert!(verify("bluetooth", perms, sum).is_ok());
    }

    #[test]
    fn every_single_bit_flip_is_detected() {
        let perms = Permissions::WIFI | Permissions::NETWORK;
        let sum = compute_checksum("wifi", perms);
        for bit in 0..32 {
            let tampered = Permissions::from_bits_retain(perms.bits() ^ (1 << bit));
            assert!(
                matches!(
                    verify("wifi", tampered, sum),
                    Err(KernelError::SecurityViolation(ref s)) if s == "wifi"
                ),
                "flip of bit {bit} went unnoticed"
            );
        }
    }

    #[test]
    fn renamed_service_is_detected() {
        let perms = Permissions::SYSTEM;
        let sum = compute_checksum("system", perms);
        assert!(verify("systen", perms, sum).is_err());
        assert!(verify("", perms, sum).is_err());
    }

    #[test]
    fn name_participates_in_checksum() {
        let perms = Permissions::STORAGE;
        assert_ne!(compute_checksum("a", perms), compute_checksum("b", perms));
        assert_ne!(
            compute_checksum("ab", Permissions::empty()),
            compute_checksum("ba", Permissions::empty())
        );
    }
}
