//! Power-of-two alignment helpers shared by the ring and staging paths.

use crate::errors::{CadenceError, Result};

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two and `value + alignment - 1`
/// must not overflow. Use [`checked_align_up`] for untrusted sizes.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Overflow-checked [`align_up`].
#[inline]
#[must_use]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Validates an alignment argument.
pub fn validate_alignment(alignment: u64) -> Result<u64> {
    if alignment.is_power_of_two() {
        Ok(alignment)
    } else {
        Err(CadenceError::InvalidAlignment(alignment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(300, 256), 512);
        assert_eq!(align_up(512, 256), 512);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn checked_align_up_detects_overflow() {
        assert_eq!(checked_align_up(u64::MAX - 3, 256), None);
        assert_eq!(checked_align_up(1000, 64), Some(1024));
    }

    #[test]
    fn validate_alignment_rejects_non_powers_of_two() {
        assert_eq!(validate_alignment(0), Err(CadenceError::InvalidAlignment(0)));
        assert_eq!(validate_alignment(48), Err(CadenceError::InvalidAlignment(48)));
        assert_eq!(validate_alignment(64), Ok(64));
    }
}
