//! Arithmetic operators on [`Expr`].
//!
//! All operators go through the canonicalizing constructors.  Subtraction is
//! addition of the negation, and multiplying by an `i64` scales a linear
//! combination instead of building a product.

use core::iter::{Product, Sum};
use core::ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use plonky2::field::extension::Extendable;
use plonky2::hash::hash_types::RichField;

use crate::expr::Expr;

impl<F: RichField + Extendable<D>, const D: usize> Add<&Expr<F, D>> for &Expr<F, D> {
    type Output = Expr<F, D>;

    fn add(self, rhs: &Expr<F, D>) -> Self::Output {
        Expr::lin_comb(&[self.clone(), rhs.clone()], &[1, 1])
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Sub<&Expr<F, D>> for &Expr<F, D> {
    type Output = Expr<F, D>;

    fn sub(self, rhs: &Expr<F, D>) -> Self::Output {
        self + &(-rhs)
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Mul<&Expr<F, D>> for &Expr<F, D> {
    type Output = Expr<F, D>;

    fn mul(self, rhs: &Expr<F, D>) -> Self::Output {
        Expr::product(&[self.clone(), rhs.clone()], &[1, 1])
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Neg for &Expr<F, D> {
    type Output = Expr<F, D>;

    fn neg(self) -> Self::Output {
        Expr::lin_comb(core::slice::from_ref(self), &[-1])
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Neg for Expr<F, D> {
    type Output = Expr<F, D>;

    fn neg(self) -> Self::Output {
        -&self
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Mul<i64> for &Expr<F, D> {
    type Output = Expr<F, D>;

    fn mul(self, rhs: i64) -> Self::Output {
        Expr::lin_comb(core::slice::from_ref(self), &[rhs])
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Mul<i64> for Expr<F, D> {
    type Output = Expr<F, D>;

    fn mul(self, rhs: i64) -> Self::Output {
        &self * rhs
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Mul<&Expr<F, D>> for i64 {
    type Output = Expr<F, D>;

    fn mul(self, rhs: &Expr<F, D>) -> Self::Output {
        rhs * self
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Mul<Expr<F, D>> for i64 {
    type Output = Expr<F, D>;

    fn mul(self, rhs: Expr<F, D>) -> Self::Output {
        &rhs * self
    }
}

impl<F: RichField + Extendable<D>, const D: usize> MulAssign<i64> for Expr<F, D> {
    fn mul_assign(&mut self, rhs: i64) {
        *self = &*self * rhs;
    }
}

/// Owned and `i64` variants of an operator defined on `&Expr`.
macro_rules! forward_binop {
    ($Op:ident, $op:ident, $OpAssign:ident, $op_assign:ident) => {
        impl<F: RichField + Extendable<D>, const D: usize> $Op<Expr<F, D>> for Expr<F, D> {
            type Output = Expr<F, D>;

            fn $op(self, rhs: Expr<F, D>) -> Self::Output {
                $Op::$op(&self, &rhs)
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $Op<&Expr<F, D>> for Expr<F, D> {
            type Output = Expr<F, D>;

            fn $op(self, rhs: &Expr<F, D>) -> Self::Output {
                $Op::$op(&self, rhs)
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $Op<Expr<F, D>> for &Expr<F, D> {
            type Output = Expr<F, D>;

            fn $op(self, rhs: Expr<F, D>) -> Self::Output {
                $Op::$op(self, &rhs)
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $OpAssign<Expr<F, D>> for Expr<F, D> {
            fn $op_assign(&mut self, rhs: Expr<F, D>) {
                *self = $Op::$op(&*self, &rhs);
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $OpAssign<&Expr<F, D>> for Expr<F, D> {
            fn $op_assign(&mut self, rhs: &Expr<F, D>) {
                *self = $Op::$op(&*self, rhs);
            }
        }
    };
}

/// `i64` variants of an operator, lifting the integer to a constant.
macro_rules! constant_binop {
    ($Op:ident, $op:ident, $OpAssign:ident, $op_assign:ident) => {
        impl<F: RichField + Extendable<D>, const D: usize> $Op<i64> for &Expr<F, D> {
            type Output = Expr<F, D>;

            fn $op(self, rhs: i64) -> Self::Output {
                $Op::$op(self, &Expr::from(rhs))
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $Op<i64> for Expr<F, D> {
            type Output = Expr<F, D>;

            fn $op(self, rhs: i64) -> Self::Output {
                $Op::$op(&self, &Expr::from(rhs))
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $Op<&Expr<F, D>> for i64 {
            type Output = Expr<F, D>;

            fn $op(self, rhs: &Expr<F, D>) -> Self::Output {
                $Op::$op(&Expr::from(self), rhs)
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $Op<Expr<F, D>> for i64 {
            type Output = Expr<F, D>;

            fn $op(self, rhs: Expr<F, D>) -> Self::Output {
                $Op::$op(&Expr::from(self), &rhs)
            }
        }

        impl<F: RichField + Extendable<D>, const D: usize> $OpAssign<i64> for Expr<F, D> {
            fn $op_assign(&mut self, rhs: i64) {
                *self = $Op::$op(&*self, &Expr::from(rhs));
            }
        }
    };
}

forward_binop!(Add, add, AddAssign, add_assign);
forward_binop!(Sub, sub, SubAssign, sub_assign);
forward_binop!(Mul, mul, MulAssign, mul_assign);
constant_binop!(Add, add, AddAssign, add_assign);
constant_binop!(Sub, sub, SubAssign, sub_assign);

impl<F: RichField + Extendable<D>, const D: usize> Sum for Expr<F, D> {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Expr::sum(&iter.collect::<Vec<_>>())
    }
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Sum<&'a Expr<F, D>> for Expr<F, D> {
    fn sum<I: Iterator<Item = &'a Expr<F, D>>>(iter: I) -> Self {
        iter.cloned().sum()
    }
}

impl<F: RichField + Extendable<D>, const D: usize> Product for Expr<F, D> {
    fn product<I: Iterator<Item = Self>>(iter: I) -> Self {
        let factors = iter.collect::<Vec<_>>();
        match factors.is_empty() {
            true => Expr::one(),
            false => Expr::product(&factors, &vec![1; factors.len()]),
        }
    }
}

impl<'a, F: RichField + Extendable<D>, const D: usize> Product<&'a Expr<F, D>> for Expr<F, D> {
    fn product<I: Iterator<Item = &'a Expr<F, D>>>(iter: I) -> Self {
        iter.cloned().product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{var, E};
    use crate::Operator;

    #[test]
    fn operators_agree_with_constructors() {
        let (x, y) = (var("x"), var("y"));
        assert_eq!(&x - &y, E::lin_comb(&[x.clone(), y.clone()], &[1, -1]));
        assert_eq!(-&x, E::lin_comb(&[x.clone()], &[-1]));
        assert_eq!(&x * &y, E::product(&[x.clone(), y.clone()], &[1, 1]));
        assert_eq!(3 * &x, E::lin_comb(&[x.clone()], &[3]));
        assert_eq!(&x * 3, 3 * x.clone());
    }

    #[test]
    fn scalar_multiplication_is_linear() {
        let x = var("x");
        match (&x * 4).op() {
            Operator::LinComb { coeffs } => assert_eq!(coeffs, &vec![4]),
            op => panic!("expected a linear combination, got {op:?}"),
        }
        assert_eq!(&x * 0, E::zero());
        assert!((&x * 1).ptr_eq(&x));
    }

    #[test]
    fn assign_operators() {
        let (x, y) = (var("x"), var("y"));
        let mut e = x.clone();
        e += &y;
        e *= 2;
        e -= 1;
        e *= x.clone();
        assert_eq!(e, (2 * (&x + &y) - 1) * &x);
    }

    #[test]
    fn sum_and_product_of_iterators() {
        let vars = ["a", "b", "c"].map(var);
        let total: E = vars.iter().sum();
        assert_eq!(total, &vars[0] + &vars[1] + &vars[2]);
        let prod: E = vars.iter().product();
        assert_eq!(prod, &vars[0] * &vars[1] * &vars[2]);
        assert_eq!(core::iter::empty::<E>().product::<E>(), E::one());
        assert_eq!(core::iter::empty::<E>().sum::<E>(), E::zero());
    }
}
