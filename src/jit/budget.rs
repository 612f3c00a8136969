//! Role-based vector register assignment.
//!
//! Fixed-purpose registers are reserved from the top of the register file,
//! in the order they are requested; whatever is left at the bottom becomes
//! the accumulator pool. The same role list therefore always produces the
//! same register numbers, which keeps generated code deterministic.

use std::fmt;

use crate::error::{Error, Result};
use crate::isa::VReg;

/// Purpose of a reserved vector register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Per-row dequantization scale.
    Scale,
    /// Per-row dequantization bias.
    Bias,
    /// Widened bytes before and after conversion to f32.
    ConvertTemp,
    /// Broadcast pooling weight.
    Weight,
    /// AVX2 remainder lane mask.
    RemainderMask,
    /// AVX2 masked-load destination.
    MaskedLoadTemp,
    /// Broadcast `1 / length`.
    Normalization,
    /// GEMM broadcast A dword.
    GemmA,
    /// GEMM B vector.
    GemmB,
    /// GEMM vector of 16-bit ones for `vpmaddwd`.
    GemmOnes,
    /// GEMM `vpmaddubsw` product.
    GemmProduct,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Vector registers split between reserved roles and accumulators.
#[derive(Debug, Clone)]
pub struct VectorRegisterBudget {
    total: usize,
    reserved: Vec<(Role, VReg)>,
}

impl VectorRegisterBudget {
    /// Empty budget over `total` physical registers.
    pub fn new(total: usize) -> Self {
        VectorRegisterBudget {
            total,
            reserved: Vec::new(),
        }
    }

    /// Takes the highest free register for `role`.
    ///
    /// Reserving the same role twice returns the first assignment.
    pub fn reserve(&mut self, role: Role) -> Result<VReg> {
        if let Some(reg) = self.get(role) {
            return Ok(reg);
        }
        if self.reserved.len() >= self.total {
            return Err(Error::RegisterBudget {
                needed: self.reserved.len() + 1,
                available: self.total,
            });
        }
        let reg = VReg((self.total - 1 - self.reserved.len()) as u8);
        self.reserved.push((role, reg));
        Ok(reg)
    }

    /// Register previously reserved for `role`.
    pub fn get(&self, role: Role) -> Option<VReg> {
        self.reserved
            .iter()
            .find(|(r, _)| *r == role)
            .map(|&(_, reg)| reg)
    }

    /// Registers not reserved for a role.
    pub fn available_accumulators(&self) -> usize {
        self.total - self.reserved.len()
    }

    /// Claims `needed` accumulator registers, numbered from zero.
    pub fn accumulators(&self, needed: usize) -> Result<Vec<VReg>> {
        let available = self.available_accumulators();
        if needed == 0 || needed > available {
            return Err(Error::RegisterBudget {
                needed: needed.max(1) + self.reserved.len(),
                available: self.total,
            });
        }
        log::trace!(
            "register budget: {} accumulators, reserved {:?}",
            needed,
            self.reserved
        );
        Ok((0..needed).map(|i| VReg(i as u8)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_taken_from_top() {
        let mut budget = VectorRegisterBudget::new(16);
        assert_eq!(budget.reserve(Role::Scale).unwrap(), VReg(15));
        assert_eq!(budget.reserve(Role::Bias).unwrap(), VReg(14));
        assert_eq!(budget.reserve(Role::Scale).unwrap(), VReg(15));
        assert_eq!(budget.get(Role::Weight), None);
        assert_eq!(budget.available_accumulators(), 14);

        let acc = budget.accumulators(14).unwrap();
        assert_eq!(acc.first(), Some(&VReg(0)));
        assert_eq!(acc.last(), Some(&VReg(13)));
    }

    #[test]
    fn test_oversubscription_fails() {
        let mut budget = VectorRegisterBudget::new(16);
        for role in [Role::GemmA, Role::GemmB, Role::GemmOnes, Role::GemmProduct] {
            budget.reserve(role).unwrap();
        }
        assert!(budget.accumulators(12).is_ok());
        match budget.accumulators(13) {
            Err(Error::RegisterBudget { needed, available }) => {
                assert_eq!(needed, 17);
                assert_eq!(available, 16);
            }
            other => panic!("expected budget error, got {other:?}"),
        }
    }
}
