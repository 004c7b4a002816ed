//! Evaluation of expressions as recursive-circuit constraints.

use itertools::Itertools;
use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;
use plonky2::iop::ext_target::ExtensionTarget;
use plonky2::plonk::circuit_builder::CircuitBuilder;

use crate::evaluator::Evaluator;
use crate::expr::coefficient;

/// Builds the gates computing an expression on a [`CircuitBuilder`].
pub struct CircuitBuilderEvaluator<'a, F: RichField + Extendable<D>, const D: usize> {
    pub builder: &'a mut CircuitBuilder<F, D>,
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Evaluator<F, D, ExtensionTarget<D>>
    for CircuitBuilderEvaluator<'a, F, D>
{
    fn constant(&mut self, value: F::Extension) -> ExtensionTarget<D> {
        self.builder.constant_extension(value)
    }

    fn lin_comb(&mut self, terms: &[ExtensionTarget<D>], coeffs: &[i64]) -> ExtensionTarget<D> {
        let mut acc: Option<ExtensionTarget<D>> = None;
        for (&term, &c) in terms.iter().zip_eq(coeffs) {
            acc = Some(match (acc, c) {
                (None, 1) => term,
                (None, _) => self.builder.mul_const_extension(coefficient(c), term),
                (Some(acc), 1) => self.builder.add_extension(acc, term),
                (Some(acc), -1) => self.builder.sub_extension(acc, term),
                (Some(acc), _) => {
                    let scaled = self.builder.mul_const_extension(coefficient(c), term);
                    self.builder.add_extension(acc, scaled)
                }
            });
        }
        acc.unwrap_or_else(|| self.builder.zero_extension())
    }

    fn product(&mut self, factors: &[ExtensionTarget<D>], exponents: &[u64]) -> ExtensionTarget<D> {
        let mut acc: Option<ExtensionTarget<D>> = None;
        for (&factor, &e) in factors.iter().zip_eq(exponents) {
            let power = match e {
                1 => factor,
                2 => self.builder.square_extension(factor),
                _ => self.builder.exp_u64_extension(factor, e),
            };
            acc = Some(match acc {
                None => power,
                Some(acc) => self.builder.mul_extension(acc, power),
            });
        }
        acc.unwrap_or_else(|| self.builder.one_extension())
    }

    fn poly_eval(
        &mut self,
        x: &ExtensionTarget<D>,
        coeffs: &[ExtensionTarget<D>],
    ) -> ExtensionTarget<D> {
        match coeffs.split_last() {
            Some((&last, rest)) => rest
                .iter()
                .rev()
                .fold(last, |acc, &c| self.builder.mul_add_extension(acc, *x, c)),
            None => self.builder.zero_extension(),
        }
    }
}
