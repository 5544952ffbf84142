//! Fixed denomination buckets.
//!
//! Every mixing and shielded operation runs on exact buckets; there is no
//! arbitrary-amount mixing or minting. Amounts that do not decompose cleanly
//! leave a plain-coin remainder.

use super::types::COIN;
use serde::{Deserialize, Serialize};

/// The supported denomination buckets, in whole coins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u64)]
pub enum Denomination {
    One = 1,
    Five = 5,
    Ten = 10,
    Fifty = 50,
    OneHundred = 100,
    FiveHundred = 500,
    OneThousand = 1000,
    FiveThousand = 5000,
}

/// All denominations, ascending.
pub const DENOMINATIONS: [Denomination; 8] = [
    Denomination::One,
    Denomination::Five,
    Denomination::Ten,
    Denomination::Fifty,
    Denomination::OneHundred,
    Denomination::FiveHundred,
    Denomination::OneThousand,
    Denomination::FiveThousand,
];

impl Denomination {
    /// Whole-coin face value.
    pub fn coins(self) -> u64 {
        self as u64
    }

    /// Face value in sub-units.
    pub fn amount(self) -> u64 {
        self as u64 * COIN
    }

    /// The denomination whose face value equals `amount` exactly, if any.
    pub fn from_amount(amount: u64) -> Option<Self> {
        DENOMINATIONS.iter().copied().find(|d| d.amount() == amount)
    }

    /// Largest denomination with face value <= `amount`.
    pub fn largest_at_most(amount: u64) -> Option<Self> {
        DENOMINATIONS
            .iter()
            .rev()
            .copied()
            .find(|d| d.amount() <= amount)
    }

    /// Next denomination above this one.
    pub fn next_larger(self) -> Option<Self> {
        DENOMINATIONS.iter().copied().find(|d| *d > self)
    }

    /// Smallest bucket. Used as the mixing collateral denomination.
    pub fn smallest() -> Self {
        Denomination::One
    }
}

impl std::fmt::Display for Denomination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.coins())
    }
}

/// Decompose `amount` into denominations, largest bucket first.
///
/// Returns the buckets and the remainder that no bucket fits. The remainder
/// stays a plain coin, minting never produces partial buckets.
pub fn decompose(mut amount: u64) -> (Vec<Denomination>, u64) {
    let mut parts = Vec::new();
    for denom in DENOMINATIONS.iter().rev() {
        while amount >= denom.amount() {
            parts.push(*denom);
            amount -= denom.amount();
        }
    }
    (parts, amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_amount_exact_only() {
        assert_eq!(Denomination::from_amount(50 * COIN), Some(Denomination::Fifty));
        assert_eq!(Denomination::from_amount(50 * COIN + 1), None);
        assert_eq!(Denomination::from_amount(0), None);
    }

    #[test]
    fn denominations_ascending() {
        for pair in DENOMINATIONS.windows(2) {
            assert!(pair[0].amount() < pair[1].amount());
        }
    }

    #[test]
    fn next_larger_chain() {
        assert_eq!(Denomination::One.next_larger(), Some(Denomination::Five));
        assert_eq!(Denomination::OneThousand.next_larger(), Some(Denomination::FiveThousand));
        assert_eq!(Denomination::FiveThousand.next_larger(), None);
    }

    #[test]
    fn largest_at_most() {
        assert_eq!(Denomination::largest_at_most(7 * COIN), Some(Denomination::Five));
        assert_eq!(Denomination::largest_at_most(COIN - 1), None);
        assert_eq!(
            Denomination::largest_at_most(u64::MAX),
            Some(Denomination::FiveThousand)
        );
    }

    #[test]
    fn decompose_exact() {
        let (parts, rem) = decompose(1555 * COIN);
        assert_eq!(
            parts,
            vec![
                Denomination::OneThousand,
                Denomination::FiveHundred,
                Denomination::Fifty,
                Denomination::Five,
            ]
        );
        assert_eq!(rem, 0);
    }

    #[test]
    fn decompose_with_remainder() {
        let (parts, rem) = decompose(6 * COIN + 123);
        assert_eq!(parts, vec![Denomination::Five, Denomination::One]);
        assert_eq!(rem, 123);
    }

    #[test]
    fn decompose_zero() {
        let (parts, rem) = decompose(0);
        assert!(parts.is_empty());
        assert_eq!(rem, 0);
    }

    #[test]
    fn decompose_sums_back() {
        for v in [1, 7, 49, 1234, 5678, 99_999] {
            let amount = v * COIN + v;
            let (parts, rem) = decompose(amount);
            let total: u64 = parts.iter().map(|d| d.amount()).sum();
            assert_eq!(total + rem, amount);
        }
    }

    #[test]
    fn repeated_buckets_allowed() {
        let (parts, rem) = decompose(3 * COIN);
        assert_eq!(parts, vec![Denomination::One; 3]);
        assert_eq!(rem, 0);
    }
}
