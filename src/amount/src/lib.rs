//! Exact fixed-point USDC amounts.
//!
//! USDC has 6 decimal places. We never use floats for money: every amount
//! is parsed once into a [`BigUint`] scaled by `10^6` and all arithmetic
//! stays in that domain. `format` is the only place decimals reappear.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub const DECIMALS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    Empty,
    MultipleDecimalPoints,
    InvalidCharacter(char),
    Negative,
    NotPositive,
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountError::Empty => write!(f, "amount string is empty"),
            AmountError::MultipleDecimalPoints => write!(f, "amount has more than one decimal point"),
            AmountError::InvalidCharacter(c) => write!(f, "amount contains invalid character '{c}'"),
            AmountError::Negative => write!(f, "amount must not be negative"),
            AmountError::NotPositive => write!(f, "amount must be strictly positive"),
        }
    }
}

impl std::error::Error for AmountError {}

impl Amount {
    pub const ZERO_STR: &'static str = "0";

    pub fn zero() -> Self {
        Amount(BigUint::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Parses a human decimal string (optional leading `+`, integer or
    /// integer.fractional) into an exact fixed-point amount. Negative
    /// values, multiple decimal points, and non-digit characters are
    /// rejected. Fractional digits beyond [`DECIMALS`] are truncated;
    /// fewer are zero-padded.
    pub fn parse(raw: &str) -> Result<Self, AmountError> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let s = match s.strip_prefix('+') {
            Some(rest) => rest,
            None => s,
        };
        if let Some(rest) = s.strip_prefix('-') {
            // Still validate the rest so we report the right class of error
            // before rejecting on sign.
            let _ = rest;
            return Err(AmountError::Negative);
        }
        if s.is_empty() {
            return Err(AmountError::Empty);
        }

        let mut parts = s.splitn(3, '.');
        let whole_str = parts.next().unwrap_or("");
        let frac_str = parts.next();
        if parts.next().is_some() {
            return Err(AmountError::MultipleDecimalPoints);
        }

        for c in whole_str.chars().chain(frac_str.unwrap_or("").chars()) {
            if !c.is_ascii_digit() {
                return Err(AmountError::InvalidCharacter(c));
            }
        }
        if whole_str.is_empty() && frac_str.map(str::is_empty).unwrap_or(true) {
            return Err(AmountError::Empty);
        }

        let whole_str = if whole_str.is_empty() { "0" } else { whole_str };
        let whole = BigUint::from_str(whole_str).map_err(|_| AmountError::Empty)?;

        let mut frac_digits = frac_str.unwrap_or("").to_string();
        frac_digits.truncate(DECIMALS as usize);
        while frac_digits.len() < DECIMALS as usize {
            frac_digits.push('0');
        }
        let frac = if frac_digits.is_empty() {
            BigUint::zero()
        } else {
            BigUint::from_str(&frac_digits).map_err(|_| AmountError::Empty)?
        };

        let scale = BigUint::from(10u32).pow(DECIMALS);
        Ok(Amount(whole * scale + frac))
    }

    /// Like [`Self::parse`] but additionally rejects zero — used wherever
    /// the specification requires a strictly positive value (spending
    /// caps at creation/delegation time).
    pub fn parse_positive(raw: &str) -> Result<Self, AmountError> {
        let amount = Self::parse(raw)?;
        if amount.is_zero() {
            return Err(AmountError::NotPositive);
        }
        Ok(amount)
    }

    /// Canonical `whole[.frac6]` representation: the fractional part is
    /// suppressed for an exact whole amount, otherwise always six digits.
    pub fn format(&self) -> String {
        let scale = BigUint::from(10u32).pow(DECIMALS);
        let whole = &self.0 / &scale;
        let frac = &self.0 % &scale;
        if frac.is_zero() {
            whole.to_string()
        } else {
            format!("{}.{:0width$}", whole, frac, width = DECIMALS as usize)
        }
    }

    pub fn add(&self, other: &Amount) -> Amount {
        Amount(&self.0 + &other.0)
    }

    /// Checked subtraction; `None` if it would go negative.
    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        if self.0 < other.0 {
            None
        } else {
            Some(Amount(&self.0 - &other.0))
        }
    }

    pub fn cmp_amount(&self, other: &Amount) -> Ordering {
        self.0.cmp(&other.0)
    }

    pub fn le(&self, other: &Amount) -> bool {
        self.0 <= other.0
    }

    pub fn lt(&self, other: &Amount) -> bool {
        self.0 < other.0
    }

    /// Micro-USDC units as `u128`, where representable. Used only for
    /// diagnostics/metrics; all comparisons must go through [`Amount`]
    /// itself, never through this lossy escape hatch.
    pub fn to_u128_lossy(&self) -> Option<u128> {
        self.0.to_u128()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

impl FromStr for Amount {
    type Err = AmountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl serde::Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.format())
    }
}

impl<'de> serde::Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(serde::de::Error::custom)
    }
}
