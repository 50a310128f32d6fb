//! Quantity conversion between volume, mass and energy
//!
//! The canonical amount of a lot is a volume in litres at 15°C. Mass (kg)
//! and energy (MJ) are always re-derived from it:
//!
//! ```text
//! mass   = volume × density        (density in kg/L)
//! energy = mass × lhv              (lhv in MJ/kg)
//! ```
//!
//! Nothing here mutates a stored amount.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Biofuel, Unit};
use crate::{Error, Result};

/// Decimal places kept when a volume is derived from mass or energy
pub const VOLUME_SCALE: u32 = 2;

/// A quantity expressed in all three units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    /// Litres at 15°C
    pub volume: Decimal,
    /// Kilograms
    pub mass: Decimal,
    /// Megajoules
    pub energy: Decimal,
}

impl Quantity {
    /// Value in the requested unit
    pub fn in_unit(&self, unit: Unit) -> Decimal {
        match unit {
            Unit::Volume => self.volume,
            Unit::Mass => self.mass,
            Unit::Energy => self.energy,
        }
    }
}

/// Convert `amount` expressed in `from` into all three units.
pub fn convert(amount: Decimal, from: Unit, biofuel: &Biofuel) -> Result<Quantity> {
    if amount < Decimal::ZERO {
        return Err(Error::MalformedParams(format!(
            "quantity must not be negative, got {}",
            amount
        )));
    }
    if biofuel.density <= Decimal::ZERO || biofuel.lhv <= Decimal::ZERO {
        return Err(Error::MalformedParams(format!(
            "biofuel {} needs a positive density and lower heating value",
            biofuel.code
        )));
    }

    let overflow = || Error::MalformedParams(format!("quantity {} out of range", amount));

    let quantity = match from {
        Unit::Volume => {
            let mass = amount.checked_mul(biofuel.density).ok_or_else(overflow)?;
            let energy = mass.checked_mul(biofuel.lhv).ok_or_else(overflow)?;
            Quantity {
                volume: amount,
                mass,
                energy,
            }
        }
        Unit::Mass => {
            let volume = amount.checked_div(biofuel.density).ok_or_else(overflow)?;
            let energy = amount.checked_mul(biofuel.lhv).ok_or_else(overflow)?;
            Quantity {
                volume,
                mass: amount,
                energy,
            }
        }
        Unit::Energy => {
            let mass = amount.checked_div(biofuel.lhv).ok_or_else(overflow)?;
            let volume = mass.checked_div(biofuel.density).ok_or_else(overflow)?;
            Quantity {
                volume,
                mass,
                energy: amount,
            }
        }
    };

    Ok(quantity)
}

/// Canonical volume for an amount declared in any unit.
///
/// Volumes derived from mass or energy are rounded to [`VOLUME_SCALE`]
/// decimals; that rounded value becomes the amount of record.
pub fn to_canonical(amount: Decimal, from: Unit, biofuel: &Biofuel) -> Result<Decimal> {
    let quantity = convert(amount, from, biofuel)?;
    Ok(match from {
        Unit::Volume => quantity.volume,
        Unit::Mass | Unit::Energy => quantity.volume.round_dp(VOLUME_SCALE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BiofuelCode;

    fn ethanol() -> Biofuel {
        Biofuel {
            code: BiofuelCode::new("ETH"),
            category: "ALCOHOL".to_string(),
            density: Decimal::new(794, 3), // 0.794 kg/L
            lhv: Decimal::new(27, 0),      // 27 MJ/kg
        }
    }

    #[test]
    fn test_volume_to_all_units() {
        let q = convert(Decimal::new(1000, 0), Unit::Volume, &ethanol()).unwrap();
        assert_eq!(q.volume, Decimal::new(1000, 0));
        assert_eq!(q.mass, Decimal::new(794, 0));
        assert_eq!(q.energy, Decimal::new(21438, 0));
    }

    #[test]
    fn test_mass_and_energy_back_to_volume() {
        let fuel = ethanol();
        let from_mass = convert(Decimal::new(794, 0), Unit::Mass, &fuel).unwrap();
        assert_eq!(from_mass.volume, Decimal::new(1000, 0));

        let from_energy = convert(Decimal::new(21438, 0), Unit::Energy, &fuel).unwrap();
        assert_eq!(from_energy.mass, Decimal::new(794, 0));
        assert_eq!(from_energy.volume, Decimal::new(1000, 0));
    }

    #[test]
    fn test_canonical_rounding() {
        let fuel = ethanol();
        // 100 kg / 0.794 = 125.944584...
        let volume = to_canonical(Decimal::new(100, 0), Unit::Mass, &fuel).unwrap();
        assert_eq!(volume, Decimal::new(12594, 2));

        let exact = to_canonical(Decimal::new(123456, 3), Unit::Volume, &fuel).unwrap();
        assert_eq!(exact, Decimal::new(123456, 3));
    }

    #[test]
    fn test_rejects_bad_reference_data() {
        let mut fuel = ethanol();
        fuel.density = Decimal::ZERO;
        let err = convert(Decimal::ONE, Unit::Mass, &fuel).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::MalformedParams);
    }

    #[test]
    fn test_rejects_negative_amount() {
        assert!(convert(Decimal::new(-1, 0), Unit::Volume, &ethanol()).is_err());
    }

    #[test]
    fn test_in_unit() {
        let q = convert(Decimal::new(10, 0), Unit::Volume, &ethanol()).unwrap();
        assert_eq!(q.in_unit(Unit::Mass), Decimal::new(794, 2));
        assert_eq!(q.in_unit(Unit::Volume), Decimal::new(10, 0));
    }
}
