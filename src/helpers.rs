use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::RID_TOMBSTONE;

/// Generate a schema-encoding bitmask from a vector of update values. Bit `k` is
/// set iff `values[k]` is `Some(_)`.
pub fn schema_encoding(values: &[Option<i64>]) -> i64 {
    let mut mask: i64 = 0;

    for (index, value) in values.iter().enumerate() {
        if value.is_some() {
            mask |= 1 << index;
        }
    }

    mask
}

/// Check whether bit `column` is set in a schema-encoding bitmask.
pub fn schema_has_column(mask: i64, column: usize) -> bool {
    mask & (1 << column) != 0
}

/// Tombstone test on the raw bit pattern of a slot value.
pub fn is_tombstone(value: i64) -> bool {
    value as u64 == RID_TOMBSTONE
}

/// Wall-clock seconds since the epoch, as stored in the timestamp column.
pub fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmask_from_update_vector() {
        assert_eq!(schema_encoding(&[None, Some(95), None, None, None]), 0b10);
        assert_eq!(schema_encoding(&[Some(1), None, Some(3)]), 0b101);
        assert_eq!(schema_encoding(&[None, None]), 0);
    }

    #[test]
    fn tombstone_is_bit_pattern_not_sign() {
        assert!(is_tombstone(-1));
        assert!(is_tombstone(RID_TOMBSTONE as i64));
        assert!(!is_tombstone(0));
        assert!(!is_tombstone(i64::MIN));
    }
}
