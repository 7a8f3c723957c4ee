//! Signed 256-bit integer in two's complement over `ethereum_types::U256`.
//! All arithmetic is explicit: `checked_*` returns `None` on overflow,
//! division by zero, and `MIN / -1`.

use ethereum_types::U256;

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct I256(U256);

impl I256 {
    pub const fn zero() -> Self {
        I256(U256::zero())
    }

    pub fn min_value() -> Self {
        I256(U256::one() << 255)
    }

    pub fn max_value() -> Self {
        I256((U256::one() << 255) - U256::one())
    }

    pub fn from_i64(v: i64) -> Self {
        if v >= 0 {
            I256(U256::from(v as u64))
        } else {
            // sign-extend the 64-bit two's complement to 256 bits
            let mag = U256::from(v.unsigned_abs());
            I256(twos_negate(mag))
        }
    }

    pub fn is_negative(&self) -> bool {
        self.0.bit(255)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Magnitude as an unsigned integer (`|MIN|` = 2^255 still fits).
    fn magnitude(&self) -> U256 {
        if self.is_negative() {
            twos_negate(self.0)
        } else {
            self.0
        }
    }

    fn from_sign_magnitude(negative: bool, mag: U256) -> Option<Self> {
        if negative {
            if mag > U256::one() << 255 {
                return None;
            }
            Some(I256(twos_negate(mag)))
        } else {
            if mag > (U256::one() << 255) - U256::one() {
                return None;
            }
            Some(I256(mag))
        }
    }

    pub fn checked_add(&self, rhs: &I256) -> Option<I256> {
        let (raw, _) = self.0.overflowing_add(rhs.0);
        let result = I256(raw);
        // overflow iff both operands share a sign the result does not
        if self.is_negative() == rhs.is_negative()
            && result.is_negative() != self.is_negative()
        {
            None
        } else {
            Some(result)
        }
    }

    pub fn checked_sub(&self, rhs: &I256) -> Option<I256> {
        let (raw, _) = self.0.overflowing_sub(rhs.0);
        let result = I256(raw);
        if self.is_negative() != rhs.is_negative()
            && result.is_negative() != self.is_negative()
        {
            None
        } else {
            Some(result)
        }
    }

    pub fn checked_mul(&self, rhs: &I256) -> Option<I256> {
        let mag = self.magnitude().checked_mul(rhs.magnitude())?;
        let negative = self.is_negative() != rhs.is_negative() && !mag.is_zero();
        Self::from_sign_magnitude(negative, mag)
    }

    /// Truncated division. `MIN / -1` overflows the type and returns `None`.
    pub fn checked_div(&self, rhs: &I256) -> Option<I256> {
        if rhs.is_zero() {
            return None;
        }
        let mag = self.magnitude() / rhs.magnitude();
        let negative = self.is_negative() != rhs.is_negative() && !mag.is_zero();
        Self::from_sign_magnitude(negative, mag)
    }

    /// Remainder with the sign of the dividend (truncated division).
    pub fn checked_rem(&self, rhs: &I256) -> Option<I256> {
        if rhs.is_zero() {
            return None;
        }
        let mag = self.magnitude() % rhs.magnitude();
        let negative = self.is_negative() && !mag.is_zero();
        Self::from_sign_magnitude(negative, mag)
    }

    pub fn to_u256(&self) -> Option<U256> {
        if self.is_negative() {
            None
        } else {
            Some(self.0)
        }
    }

    pub fn from_u256(v: U256) -> Option<I256> {
        if v.bit(255) {
            None
        } else {
            Some(I256(v))
        }
    }

    /// Minimal big-endian two's-complement bytes: the shortest prefix-stripped
    /// form that still round-trips the sign.
    pub fn to_minimal_be_bytes(&self) -> Vec<u8> {
        let full = self.0.to_big_endian();
        let mut start = 0;
        while start < 31 {
            let redundant = (full[start] == 0x00 && full[start + 1] < 0x80)
                || (full[start] == 0xff && full[start + 1] >= 0x80);
            if !redundant {
                break;
            }
            start += 1;
        }
        full[start..].to_vec()
    }

    /// Sign-extend up to 32 big-endian bytes.
    pub fn from_be_bytes(bytes: &[u8]) -> I256 {
        debug_assert!(!bytes.is_empty() && bytes.len() <= 32);
        let mut full = if bytes[0] >= 0x80 { [0xffu8; 32] } else { [0u8; 32] };
        full[32 - bytes.len()..].copy_from_slice(bytes);
        I256(U256::from_big_endian(&full))
    }
}

fn twos_negate(v: U256) -> U256 {
    (!v).overflowing_add(U256::one()).0
}

impl Ord for I256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // flipping the sign bit maps two's-complement order onto unsigned order
        let flip = U256::one() << 255;
        (self.0 ^ flip).cmp(&(other.0 ^ flip))
    }
}

impl PartialOrd for I256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for I256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_negative() {
            write!(f, "-{}", self.magnitude())
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::fmt::Debug for I256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "I256({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_sub() {
        let one = I256::from_i64(1);
        let neg_one = I256::from_i64(-1);
        assert_eq!(one.checked_add(&neg_one), Some(I256::zero()));
        assert_eq!(I256::max_value().checked_add(&one), None);
        assert_eq!(I256::min_value().checked_sub(&one), None);
        assert_eq!(I256::min_value().checked_add(&neg_one), None);
        assert_eq!(
            I256::max_value().checked_add(&neg_one),
            Some(I256::max_value().checked_sub(&one).unwrap())
        );
    }

    #[test]
    fn test_checked_mul() {
        let two = I256::from_i64(2);
        assert_eq!(
            I256::from_i64(-3).checked_mul(&two),
            Some(I256::from_i64(-6))
        );
        assert_eq!(I256::max_value().checked_mul(&two), None);
        // MIN = -2 * 2^254 is representable
        let half_min = I256::min_value().checked_div(&two).unwrap();
        assert_eq!(half_min.checked_mul(&two), Some(I256::min_value()));
        assert_eq!(I256::min_value().checked_mul(&I256::from_i64(-1)), None);
    }

    #[test]
    fn test_checked_div_rem() {
        let zero = I256::zero();
        assert_eq!(I256::from_i64(5).checked_div(&zero), None);
        assert_eq!(I256::from_i64(5).checked_rem(&zero), None);
        assert_eq!(I256::min_value().checked_div(&I256::from_i64(-1)), None);
        assert_eq!(
            I256::min_value().checked_rem(&I256::from_i64(-1)),
            Some(I256::zero())
        );
        assert_eq!(
            I256::from_i64(-7).checked_div(&I256::from_i64(2)),
            Some(I256::from_i64(-3))
        );
        assert_eq!(
            I256::from_i64(-7).checked_rem(&I256::from_i64(2)),
            Some(I256::from_i64(-1))
        );
    }

    #[test]
    fn test_ordering() {
        let mut values = vec![
            I256::max_value(),
            I256::from_i64(-1),
            I256::zero(),
            I256::min_value(),
            I256::from_i64(1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                I256::min_value(),
                I256::from_i64(-1),
                I256::zero(),
                I256::from_i64(1),
                I256::max_value(),
            ]
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(I256::from_i64(-1).to_u256(), None);
        assert_eq!(I256::from_i64(7).to_u256(), Some(U256::from(7u8)));
        assert_eq!(I256::from_u256(U256::one() << 255), None);
        assert_eq!(
            I256::from_u256((U256::one() << 255) - U256::one()),
            Some(I256::max_value())
        );
    }

    #[test]
    fn test_minimal_bytes_roundtrip() {
        for v in [0i64, 1, -1, 127, 128, -128, -129, i64::MAX, i64::MIN] {
            let value = I256::from_i64(v);
            let bytes = value.to_minimal_be_bytes();
            assert_eq!(I256::from_be_bytes(&bytes), value, "value {}", v);
        }
        assert_eq!(I256::min_value().to_minimal_be_bytes().len(), 32);
        assert_eq!(
            I256::from_be_bytes(&I256::min_value().to_minimal_be_bytes()),
            I256::min_value()
        );
    }
}
