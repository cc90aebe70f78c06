//! Binary combinator tree over the distance fields of a stream.

use crate::graph::component::CombineOp;
use crate::kernel::ir::{Builtin, Expr};

#[derive(Clone, Debug, PartialEq)]
pub enum CombineTree {
    Leaf(usize),
    Combine(CombineOp, Box<CombineTree>, Box<CombineTree>),
}

impl CombineTree {
    pub fn leaf(index: usize) -> Self {
        CombineTree::Leaf(index)
    }

    pub fn combine(op: CombineOp, left: CombineTree, right: CombineTree) -> Self {
        CombineTree::Combine(op, Box::new(left), Box::new(right))
    }

    /// Fold `node` into the running tree; the first node initializes it.
    pub fn push(running: Option<CombineTree>, op: CombineOp, node: CombineTree) -> CombineTree {
        match running {
            None => node,
            Some(tree) => CombineTree::combine(op, tree, node),
        }
    }

    /// Leaf indices, left to right.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves(&self, out: &mut Vec<usize>) {
        match self {
            CombineTree::Leaf(i) => out.push(*i),
            CombineTree::Combine(_, l, r) => {
                l.collect_leaves(out);
                r.collect_leaves(out);
            }
        }
    }

    pub fn to_expr(&self, leaf: &dyn Fn(usize) -> Expr) -> Expr {
        match self {
            CombineTree::Leaf(i) => leaf(*i),
            CombineTree::Combine(op, l, r) => combine_expr(*op, l.to_expr(leaf), r.to_expr(leaf)),
        }
    }

    /// Evaluate with plain floats.
    pub fn eval(&self, leaf: &dyn Fn(usize) -> f32) -> f32 {
        match self {
            CombineTree::Leaf(i) => leaf(*i),
            CombineTree::Combine(op, l, r) => op.apply(l.eval(leaf), r.eval(leaf)),
        }
    }
}

pub fn combine_expr(op: CombineOp, a: Expr, b: Expr) -> Expr {
    match op {
        CombineOp::Union => Expr::call(Builtin::Min, vec![a, b]),
        CombineOp::Intersect => Expr::call(Builtin::Max, vec![a, b]),
        CombineOp::Subtract => Expr::call(Builtin::Max, vec![a, b.neg()]),
    }
}
