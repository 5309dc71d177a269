//! Fixed-Point Arithmetic
//!
//! All prices, quantities, fees, funding and PnL are carried internally as
//! `Fp`: a signed 128-bit integer scaled by 1e8 (like satoshis but for USDT).
//! Floats exist only at the external boundary (depth feed in, log records out).
//!
//! # Rounding Policy
//!
//! - Boundary ingest (`from_f64`): half-away-from-zero at the 1e-8 digit.
//! - Internal mul/div: half-away-from-zero on the dropped digits, applied in
//!   the exact order the engine performs the operations. This makes results
//!   bit-identical across runs for the same input stream.
//! - Log output: values are already exact multiples of 1e-8, so the 8-decimal
//!   banker's rounding required at the boundary reduces to the identity; the
//!   serializer emits the full 8-decimal string.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// Conversion factor: 1.0 == 100_000_000 units.
pub const FP_SCALE: i128 = 100_000_000;

/// Basis-point denominator (1 bps = 1/10_000).
pub const BPS_DENOM: i128 = 10_000;

/// Fixed-point scalar, value x 1e8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fp(i128);

/// Divide with half-away-from-zero rounding. `d` must be positive.
#[inline]
fn div_round(n: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    if n >= 0 {
        (n + d / 2) / d
    } else {
        -((-n + d / 2) / d)
    }
}

impl Fp {
    pub const ZERO: Fp = Fp(0);
    pub const ONE: Fp = Fp(FP_SCALE);

    /// Construct from raw 1e8-scaled units.
    #[inline]
    pub const fn from_raw(raw: i128) -> Self {
        Fp(raw)
    }

    /// Raw 1e8-scaled units.
    #[inline]
    pub const fn raw(self) -> i128 {
        self.0
    }

    /// Construct from an integer value.
    #[inline]
    pub const fn from_int(v: i64) -> Self {
        Fp(v as i128 * FP_SCALE)
    }

    /// Construct from a basis-point count (25 -> 0.0025).
    #[inline]
    pub const fn from_bps(bps: i64) -> Self {
        Fp(bps as i128 * FP_SCALE / BPS_DENOM)
    }

    /// Boundary ingest. Rounds half-away-from-zero at 1e-8.
    /// Returns `None` for non-finite input or values outside the i128 range.
    pub fn from_f64(v: f64) -> Option<Self> {
        if !v.is_finite() {
            return None;
        }
        let scaled = v * FP_SCALE as f64;
        if scaled.abs() >= i128::MAX as f64 / 2.0 {
            return None;
        }
        Some(Fp(scaled.round() as i128))
    }

    /// Boundary egress. `Fp` is an exact multiple of 1e-8, so rounding the
    /// float representation to 8 decimals (banker's policy) is the identity.
    #[inline]
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / FP_SCALE as f64
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// -1, 0 or +1.
    #[inline]
    pub fn signum(self) -> i32 {
        self.0.signum() as i32
    }

    #[inline]
    pub fn abs(self) -> Fp {
        Fp(self.0.abs())
    }

    #[inline]
    pub fn min(self, other: Fp) -> Fp {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    #[inline]
    pub fn max(self, other: Fp) -> Fp {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    /// Fixed-point multiply: (a * b) / 1e8, half-away-from-zero.
    #[inline]
    pub fn mul(self, rhs: Fp) -> Fp {
        Fp(div_round(self.0 * rhs.0, FP_SCALE))
    }

    /// Fixed-point divide: (a * 1e8) / b, half-away-from-zero.
    /// The caller must guard against a zero divisor; use `checked_div` where
    /// the divisor is data-driven.
    #[inline]
    pub fn div(self, rhs: Fp) -> Fp {
        self.checked_div(rhs).unwrap_or(Fp::ZERO)
    }

    /// Fixed-point divide returning `None` on a zero divisor.
    pub fn checked_div(self, rhs: Fp) -> Option<Fp> {
        if rhs.0 == 0 {
            return None;
        }
        let (n, d) = if rhs.0 > 0 {
            (self.0, rhs.0)
        } else {
            (-self.0, -rhs.0)
        };
        Some(Fp(div_round(n * FP_SCALE, d)))
    }

    /// Clamp into [lo, hi].
    #[inline]
    pub fn clamp(self, lo: Fp, hi: Fp) -> Fp {
        self.max(lo).min(hi)
    }

    /// Integer square root in fixed-point: sqrt(v), exact to 1e-8.
    /// Returns ZERO for negative input.
    pub fn sqrt(self) -> Fp {
        if self.0 <= 0 {
            return Fp::ZERO;
        }
        // sqrt(raw / 1e8) * 1e8 == isqrt(raw * 1e8)
        let target = self.0 * FP_SCALE;
        let mut x = {
            // Initial guess from the float sqrt, then Newton to exactness.
            let guess = (target as f64).sqrt() as i128;
            guess.max(1)
        };
        loop {
            let next = (x + target / x) / 2;
            if (next - x).abs() <= 1 {
                // Settle on the floor value.
                let mut r = next.min(x);
                while (r + 1) * (r + 1) <= target {
                    r += 1;
                }
                while r * r > target {
                    r -= 1;
                }
                return Fp(r);
            }
            x = next;
        }
    }
}

impl Add for Fp {
    type Output = Fp;
    #[inline]
    fn add(self, rhs: Fp) -> Fp {
        Fp(self.0 + rhs.0)
    }
}

impl Sub for Fp {
    type Output = Fp;
    #[inline]
    fn sub(self, rhs: Fp) -> Fp {
        Fp(self.0 - rhs.0)
    }
}

impl Neg for Fp {
    type Output = Fp;
    #[inline]
    fn neg(self) -> Fp {
        Fp(-self.0)
    }
}

impl AddAssign for Fp {
    #[inline]
    fn add_assign(&mut self, rhs: Fp) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Fp {
    #[inline]
    fn sub_assign(&mut self, rhs: Fp) {
        self.0 -= rhs.0;
    }
}

impl Sum for Fp {
    fn sum<I: Iterator<Item = Fp>>(iter: I) -> Fp {
        iter.fold(Fp::ZERO, |acc, v| acc + v)
    }
}

impl fmt::Display for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / FP_SCALE as u128;
        let frac = abs % FP_SCALE as u128;
        write!(f, "{}{}.{:08}", sign, whole, frac)
    }
}

impl Serialize for Fp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct FpVisitor;

impl Visitor<'_> for FpVisitor {
    type Value = Fp;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an 8-decimal string or a finite number")
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Fp, E> {
        parse_fp(s).ok_or_else(|| E::custom(format!("invalid fixed-point literal: {s}")))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Fp, E> {
        Fp::from_f64(v).ok_or_else(|| E::custom("non-finite fixed-point value"))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Fp, E> {
        Ok(Fp::from_int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Fp, E> {
        Ok(Fp(v as i128 * FP_SCALE))
    }
}

impl<'de> Deserialize<'de> for Fp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Fp, D::Error> {
        deserializer.deserialize_any(FpVisitor)
    }
}

/// Parse a decimal literal with up to 8 fraction digits. Extra digits are
/// rounded half-away-from-zero.
fn parse_fp(s: &str) -> Option<Fp> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut parts = rest.splitn(2, '.');
    let whole_str = parts.next()?;
    let frac_str = parts.next().unwrap_or("");
    if whole_str.is_empty() && frac_str.is_empty() {
        return None;
    }
    let whole: i128 = if whole_str.is_empty() {
        0
    } else {
        whole_str.parse().ok()?
    };
    let mut frac: i128 = 0;
    let mut round_up = false;
    for (i, c) in frac_str.chars().enumerate() {
        let digit = c.to_digit(10)? as i128;
        if i < 8 {
            frac = frac * 10 + digit;
        } else if i == 8 {
            round_up = digit >= 5;
            break;
        }
    }
    let frac_digits = frac_str.len().min(8);
    for _ in frac_digits..8 {
        frac *= 10;
    }
    let mut raw = whole * FP_SCALE + frac;
    if round_up {
        raw += 1;
    }
    Some(Fp(if neg { -raw } else { raw }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f64_round_trip() {
        let fp = Fp::from_f64(100.0).unwrap();
        assert_eq!(fp, Fp::from_int(100));
        assert_eq!(fp.to_f64(), 100.0);
    }

    #[test]
    fn test_from_f64_rounds_half_away_from_zero() {
        assert_eq!(Fp::from_f64(0.000000005).unwrap().raw(), 1);
        assert_eq!(Fp::from_f64(-0.000000005).unwrap().raw(), -1);
        assert_eq!(Fp::from_f64(0.000000004).unwrap().raw(), 0);
    }

    #[test]
    fn test_from_f64_rejects_non_finite() {
        assert!(Fp::from_f64(f64::NAN).is_none());
        assert!(Fp::from_f64(f64::INFINITY).is_none());
    }

    #[test]
    fn test_mul() {
        let price = Fp::from_int(100);
        let qty = Fp::from_f64(0.5).unwrap();
        assert_eq!(price.mul(qty), Fp::from_int(50));
    }

    #[test]
    fn test_mul_rounding() {
        // 0.00000001 * 0.5 = 0.000000005 -> rounds away from zero to 1 raw unit
        let tiny = Fp::from_raw(1);
        let half = Fp::from_f64(0.5).unwrap();
        assert_eq!(tiny.mul(half).raw(), 1);
        assert_eq!((-tiny).mul(half).raw(), -1);
    }

    #[test]
    fn test_div() {
        let notional = Fp::from_int(300);
        let qty = Fp::from_int(3);
        assert_eq!(notional.div(qty), Fp::from_int(100));
        assert!(notional.checked_div(Fp::ZERO).is_none());
    }

    #[test]
    fn test_div_negative_divisor() {
        let n = Fp::from_int(10);
        assert_eq!(n.div(Fp::from_int(-4)), Fp::from_f64(-2.5).unwrap());
    }

    #[test]
    fn test_sqrt() {
        assert_eq!(Fp::from_int(4).sqrt(), Fp::from_int(2));
        assert_eq!(Fp::from_f64(0.25).unwrap().sqrt(), Fp::from_f64(0.5).unwrap());
        assert_eq!(Fp::ZERO.sqrt(), Fp::ZERO);
        assert_eq!(Fp::from_int(-1).sqrt(), Fp::ZERO);
        // sqrt(2) to 1e-8: 1.41421356
        assert_eq!(Fp::from_int(2).sqrt().raw(), 141_421_356);
    }

    #[test]
    fn test_display_format() {
        assert_eq!(Fp::from_int(100).to_string(), "100.00000000");
        assert_eq!(Fp::from_f64(-0.04).unwrap().to_string(), "-0.04000000");
        assert_eq!(Fp::from_raw(1).to_string(), "0.00000001");
    }

    #[test]
    fn test_serde_string_round_trip() {
        let fp = Fp::from_f64(999.96).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"999.96000000\"");
        let back: Fp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_deserialize_from_number() {
        let fp: Fp = serde_json::from_str("100.5").unwrap();
        assert_eq!(fp, Fp::from_f64(100.5).unwrap());
        let fp: Fp = serde_json::from_str("42").unwrap();
        assert_eq!(fp, Fp::from_int(42));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(serde_json::from_str::<Fp>("\"\"").is_err());
        assert!(serde_json::from_str::<Fp>("\"abc\"").is_err());
    }

    #[test]
    fn test_from_bps() {
        assert_eq!(Fp::from_bps(4), Fp::from_f64(0.0004).unwrap());
        assert_eq!(Fp::from_bps(10_000), Fp::ONE);
    }
}
