//! Typed lowering of a component body into kernel IR.
//!
//! A component becomes one labeled block: its kind inputs are bound with `let`,
//! its outputs are `var`s seeded from caller-owned variables and copied back at
//! the end of the block, and every literal or field reads its property slot.

use std::collections::HashMap;

use crate::error::{BuildError, GraphError};
use crate::graph::component::{AssignOperator, Component, Statement};
use crate::graph::fragment::{Fragment, FragmentKind};
use crate::kernel::ir::{AssignOp, BinaryOp, Builtin, Expr, Stmt};
use crate::kernel::types::{ValueType, type_name_arity};
use crate::kernel::utils::user_ident;

use super::monitor::widen;
use super::property::{GLOBALS_SLOT, PropertyTable, SlotKey};

/// Global read by `time` in component bodies.
pub const GLOBAL_TIME: &str = "time";
/// Global read by `seed` in component bodies.
pub const GLOBAL_SEED: &str = "seed";

/// How a component block is wired into the surrounding kernel.
#[derive(Clone, Debug, Default)]
pub struct BlockSpec {
    /// Values for the kind's inputs. Inputs left out read as zero.
    pub inputs: Vec<(String, Expr)>,
    /// Kind output -> caller variable that seeds it and receives its final value.
    pub outputs: Vec<(String, String)>,
    /// Variable to capture (widened to `vec4f`) into a caller `vec4f` variable.
    pub capture: Option<Capture>,
}

impl BlockSpec {
    pub fn input(mut self, name: &str, value: Expr) -> Self {
        self.inputs.push((name.to_string(), value));
        self
    }

    pub fn output(mut self, name: &str, outer: &str) -> Self {
        self.outputs.push((name.to_string(), outer.to_string()));
        self
    }

    pub fn capture(mut self, fragment: &str, into: &str) -> Self {
        self.capture = Some(Capture {
            fragment: fragment.to_string(),
            into: into.to_string(),
        });
        self
    }
}

#[derive(Clone, Debug)]
pub struct Capture {
    pub fragment: String,
    pub into: String,
}

#[derive(Clone, Debug)]
pub struct LoweredBlock {
    pub stmt: Stmt,
    /// Type of the captured value, when a capture was requested.
    pub captured: Option<ValueType>,
}

/// Block label used for debug line ranges.
pub fn block_label(component: &Component) -> String {
    format!("component {}", component.id)
}

pub fn lower_component(
    component: &Component,
    table: &PropertyTable,
    spec: &BlockSpec,
) -> Result<LoweredBlock, BuildError> {
    let mut lowerer = Lowerer {
        component,
        table,
        vars: HashMap::new(),
    };
    let mut body = Vec::new();

    for (name, ty) in component.kind.inputs() {
        let value = spec
            .inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| zero(*ty));
        body.push(Stmt::let_(user_ident(name), value));
        lowerer.declare(name, *ty, false);
    }
    for (name, ty) in component.kind.outputs() {
        let seed = spec
            .outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outer)| Expr::var(outer.as_str()));
        body.push(Stmt::Var {
            name: user_ident(name),
            ty: *ty,
            value: seed,
        });
        lowerer.declare(name, *ty, true);
    }

    for (si, statement) in component.body.iter().enumerate() {
        body.push(lowerer.statement(si, statement)?);
    }

    for (name, outer) in &spec.outputs {
        if !component.kind.outputs().iter().any(|(n, _)| n == name) {
            return Err(BuildError::KindMismatch {
                component: component.id.clone(),
                kind: component.kind.to_string(),
                context: format!("no output named '{name}'"),
            });
        }
        body.push(Stmt::set(outer.as_str(), Expr::var(user_ident(name))));
    }

    let mut captured = None;
    if let Some(capture) = &spec.capture {
        let (value, ty) = lowerer.capture_value(&capture.fragment)?;
        body.push(Stmt::set(capture.into.as_str(), widen(value, ty)));
        captured = Some(ty);
    }

    Ok(LoweredBlock {
        stmt: Stmt::Block {
            label: Some(block_label(component)),
            body,
        },
        captured,
    })
}

fn zero(ty: ValueType) -> Expr {
    match ty {
        ValueType::F32 => Expr::Const(0.0),
        other => Expr::vec(other, vec![Expr::Const(0.0)]),
    }
}

#[derive(Clone, Copy)]
struct VarInfo {
    ty: ValueType,
    mutable: bool,
}

struct Lowerer<'a> {
    component: &'a Component,
    table: &'a PropertyTable,
    vars: HashMap<String, VarInfo>,
}

impl Lowerer<'_> {
    fn declare(&mut self, name: &str, ty: ValueType, mutable: bool) {
        self.vars.insert(name.to_string(), VarInfo { ty, mutable });
    }

    fn type_error(&self, message: impl Into<String>) -> BuildError {
        BuildError::type_error(&self.component.id, message)
    }

    fn statement(&mut self, si: usize, statement: &Statement) -> Result<Stmt, BuildError> {
        match statement {
            Statement::Define {
                name,
                type_name,
                value,
            } => {
                if self.vars.contains_key(name) {
                    return Err(self.type_error(format!("'{name}' is already defined")));
                }
                let ty = ValueType::from_type_name(type_name)?;
                let (expr, vty) = self.fragment(value, &mut vec![si, 0])?;
                let expr = self.coerce(expr, vty, ty, name)?;
                self.declare(name, ty, true);
                Ok(Stmt::Var {
                    name: user_ident(name),
                    ty,
                    value: Some(expr),
                })
            }
            Statement::Assign { target, op, value } => {
                if !matches!(
                    target.kind,
                    FragmentKind::VariableReference | FragmentKind::OutVariable
                ) {
                    return Err(self.type_error("assignment target must be a variable"));
                }
                let info = match self.vars.get(&target.name) {
                    Some(info) => *info,
                    None if self.component.fields.contains_key(&target.name) => {
                        return Err(
                            self.type_error(format!("field '{}' is read-only", target.name))
                        );
                    }
                    None => {
                        return Err(BuildError::UnknownVariable {
                            component: self.component.id.clone(),
                            name: target.name.clone(),
                        });
                    }
                };
                if !info.mutable {
                    return Err(self.type_error(format!("input '{}' is read-only", target.name)));
                }
                let (expr, vty) = self.fragment(value, &mut vec![si, 0])?;
                let op = assign_op(*op);

                let (component, target_ty) = match target.qualifier.len() {
                    0 => (None, info.ty),
                    1 => {
                        let c = swizzle_pattern(&target.qualifier, info.ty)
                            .ok_or_else(|| {
                                self.type_error(format!(
                                    "bad qualifier '{}' on '{}'",
                                    target.qualifier, target.name
                                ))
                            })?
                            .chars()
                            .next();
                        (c, ValueType::F32)
                    }
                    _ => {
                        return Err(self.type_error(format!(
                            "cannot assign through multi-component qualifier '{}'",
                            target.qualifier
                        )));
                    }
                };
                let expr = if op == AssignOp::Set || vty != ValueType::F32 {
                    self.coerce(expr, vty, target_ty, &target.name)?
                } else {
                    expr
                };
                Ok(Stmt::Assign {
                    target: user_ident(&target.name),
                    component,
                    op,
                    value: expr,
                })
            }
        }
    }

    fn coerce(
        &self,
        expr: Expr,
        from: ValueType,
        to: ValueType,
        name: &str,
    ) -> Result<Expr, BuildError> {
        if from == to {
            return Ok(expr);
        }
        if from == ValueType::F32 {
            return Ok(Expr::vec(to, vec![expr]));
        }
        Err(self.type_error(format!(
            "'{name}' expects {} but the value is {}",
            to.type_name(),
            from.type_name()
        )))
    }

    fn fragment(
        &self,
        fragment: &Fragment,
        path: &mut Vec<usize>,
    ) -> Result<(Expr, ValueType), BuildError> {
        let (mut expr, mut ty) = match fragment.kind {
            FragmentKind::ConstantValue => {
                let slot = self
                    .table
                    .slot(&SlotKey::literal(&self.component.id, path))?;
                (
                    Expr::Property {
                        slot,
                        ty: ValueType::F32,
                    },
                    ValueType::F32,
                )
            }
            FragmentKind::ConstantDefinition => {
                let ty = ValueType::from_type_name(&fragment.type_name)?;
                let slot = self
                    .table
                    .slot(&SlotKey::literal(&self.component.id, path))?;
                (Expr::Property { slot, ty }, ty)
            }
            FragmentKind::VariableReference | FragmentKind::OutVariable => {
                self.reference(&fragment.name)?
            }
            FragmentKind::Primitive => {
                let args = self.arguments(fragment, path)?;
                self.primitive(&fragment.name, args)?
            }
            FragmentKind::Arithmetic => {
                let op = BinaryOp::from_symbol(&fragment.name).ok_or_else(|| {
                    BuildError::UnknownFunction {
                        component: self.component.id.clone(),
                        name: fragment.name.clone(),
                    }
                })?;
                let mut args = self.arguments(fragment, path)?;
                if args.len() != 2 {
                    return Err(self.type_error(format!(
                        "'{}' takes 2 operands, got {}",
                        fragment.name,
                        args.len()
                    )));
                }
                let (b, bt) = args.pop().ok_or_else(|| self.type_error("missing operand"))?;
                let (a, at) = args.pop().ok_or_else(|| self.type_error("missing operand"))?;
                let ty = if at == bt || bt == ValueType::F32 {
                    at
                } else if at == ValueType::F32 {
                    bt
                } else {
                    return Err(self.type_error(format!(
                        "cannot apply '{}' to {} and {}",
                        fragment.name,
                        at.type_name(),
                        bt.type_name()
                    )));
                };
                (Expr::bin(op, a, b), ty)
            }
        };

        if !fragment.qualifier.is_empty() {
            let pattern = swizzle_pattern(&fragment.qualifier, ty).ok_or_else(|| {
                self.type_error(format!(
                    "bad qualifier '{}' on {}",
                    fragment.qualifier,
                    ty.type_name()
                ))
            })?;
            ty = ValueType::from_arity(pattern.len())
                .ok_or_else(|| self.type_error("qualifier too long"))?;
            expr = expr.swizzle(&pattern);
        }
        if fragment.negated {
            expr = expr.neg();
        }
        Ok((expr, ty))
    }

    fn arguments(
        &self,
        fragment: &Fragment,
        path: &mut Vec<usize>,
    ) -> Result<Vec<(Expr, ValueType)>, BuildError> {
        let mut out = Vec::with_capacity(fragment.arguments.len());
        for (i, arg) in fragment.arguments.iter().enumerate() {
            path.push(i);
            let lowered = self.fragment(arg, path);
            path.pop();
            out.push(lowered?);
        }
        Ok(out)
    }

    fn reference(&self, name: &str) -> Result<(Expr, ValueType), BuildError> {
        if let Some(info) = self.vars.get(name) {
            return Ok((Expr::var(user_ident(name)), info.ty));
        }
        if self.component.fields.contains_key(name) {
            let slot = self.table.slot(&SlotKey::field(&self.component.id, name))?;
            return Ok((
                Expr::Property {
                    slot,
                    ty: ValueType::F32,
                },
                ValueType::F32,
            ));
        }
        match name {
            GLOBAL_TIME => Ok((
                Expr::Property {
                    slot: GLOBALS_SLOT,
                    ty: ValueType::F32,
                },
                ValueType::F32,
            )),
            GLOBAL_SEED => Ok((
                Expr::Property {
                    slot: GLOBALS_SLOT,
                    ty: ValueType::Vec2,
                }
                .swizzle("y"),
                ValueType::F32,
            )),
            _ => Err(BuildError::UnknownVariable {
                component: self.component.id.clone(),
                name: name.to_string(),
            }),
        }
    }

    fn capture_value(&self, fragment: &str) -> Result<(Expr, ValueType), BuildError> {
        self.reference(fragment)
            .map_err(|_| BuildError::MonitorTargetMissing {
                component: self.component.id.clone(),
                fragment: fragment.to_string(),
            })
    }

    fn primitive(
        &self,
        name: &str,
        args: Vec<(Expr, ValueType)>,
    ) -> Result<(Expr, ValueType), BuildError> {
        if let Some(arity) = type_name_arity(name) {
            return self.construct(name, arity, args);
        }
        let builtin = Builtin::from_name(name).ok_or_else(|| BuildError::UnknownFunction {
            component: self.component.id.clone(),
            name: name.to_string(),
        })?;
        if args.len() != builtin.arg_count() {
            return Err(self.type_error(format!(
                "'{name}' takes {} arguments, got {}",
                builtin.arg_count(),
                args.len()
            )));
        }
        let types: Vec<ValueType> = args.iter().map(|(_, t)| *t).collect();
        let exprs: Vec<Expr> = args.into_iter().map(|(e, _)| e).collect();
        let bad = || {
            self.type_error(format!(
                "'{name}' does not accept ({})",
                types
                    .iter()
                    .map(|t| t.type_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        };

        use Builtin::*;
        let ty = match builtin {
            Length => ValueType::F32,
            Distance => {
                if types[0] != types[1] {
                    return Err(bad());
                }
                ValueType::F32
            }
            Dot => {
                if types[0] != types[1] || types[0] == ValueType::F32 {
                    return Err(bad());
                }
                ValueType::F32
            }
            Cross => {
                if types[0] != ValueType::Vec3 || types[1] != ValueType::Vec3 {
                    return Err(bad());
                }
                ValueType::Vec3
            }
            Normalize => {
                if types[0] == ValueType::F32 {
                    return Err(bad());
                }
                types[0]
            }
            Reflect => {
                if types[0] != types[1] || types[0] == ValueType::F32 {
                    return Err(bad());
                }
                types[0]
            }
            Mix => {
                let t = widest(&types[..2]).ok_or_else(bad)?;
                if types[2] != ValueType::F32 && types[2] != t {
                    return Err(bad());
                }
                let mut exprs = exprs;
                let blend = exprs.pop().ok_or_else(bad)?;
                let mut parts = splat_all(exprs, &types[..2], t);
                parts.push(blend);
                return Ok((Expr::call(builtin, parts), t));
            }
            Atan2 | Pow | Min | Max | Step | Clamp | Smoothstep => {
                let t = widest(&types).ok_or_else(bad)?;
                return Ok((Expr::call(builtin, splat_all(exprs, &types, t)), t));
            }
            Abs | Sign | Floor | Ceil | Fract | Sqrt | Sin | Cos | Tan | Exp | Log | Radians => {
                types[0]
            }
        };
        Ok((Expr::call(builtin, exprs), ty))
    }

    fn construct(
        &self,
        name: &str,
        arity: usize,
        args: Vec<(Expr, ValueType)>,
    ) -> Result<(Expr, ValueType), BuildError> {
        let ty = ValueType::from_arity(arity)
            .ok_or_else(|| self.type_error(format!("bad constructor '{name}'")))?;
        let total: usize = args.iter().map(|(_, t)| t.arity()).sum();
        let splat = args.len() == 1 && args[0].1 == ValueType::F32;
        if total != arity && !splat {
            return Err(BuildError::Graph(GraphError::ArityMismatch {
                name: format!("{}:{name}", self.component.id),
                expected: arity,
                found: total,
            }));
        }
        let parts: Vec<Expr> = args.into_iter().map(|(e, _)| e).collect();
        Ok((Expr::vec(ty, parts), ty))
    }
}

fn assign_op(op: AssignOperator) -> AssignOp {
    match op {
        AssignOperator::Set => AssignOp::Set,
        AssignOperator::Add => AssignOp::Add,
        AssignOperator::Sub => AssignOp::Sub,
        AssignOperator::Mul => AssignOp::Mul,
        AssignOperator::Div => AssignOp::Div,
    }
}

/// Widest type when every other argument is either that type or a scalar.
fn widest(types: &[ValueType]) -> Option<ValueType> {
    let t = types.iter().copied().max()?;
    types
        .iter()
        .all(|x| *x == t || *x == ValueType::F32)
        .then_some(t)
}

fn splat_all(exprs: Vec<Expr>, types: &[ValueType], to: ValueType) -> Vec<Expr> {
    exprs
        .into_iter()
        .zip(types)
        .map(|(e, t)| {
            if *t == to {
                e
            } else {
                Expr::vec(to, vec![e])
            }
        })
        .collect()
}

/// Normalize a qualifier to `xyzw` letters and check it against `ty`.
fn swizzle_pattern(qualifier: &str, ty: ValueType) -> Option<String> {
    if qualifier.is_empty() || qualifier.len() > 4 {
        return None;
    }
    let mut out = String::with_capacity(qualifier.len());
    for ch in qualifier.chars() {
        let (letter, index) = match ch {
            'x' | 'r' => ('x', 0),
            'y' | 'g' => ('y', 1),
            'z' | 'b' => ('z', 2),
            'w' | 'a' => ('w', 3),
            _ => return None,
        };
        if index >= ty.arity() {
            return None;
        }
        out.push(letter);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::property::dry_run;
    use crate::graph::component::ComponentKind;
    use crate::graph::library::{box_2d, circle_2d, pinhole_camera_3d};

    fn table_for(c: &Component) -> PropertyTable {
        let mut t = PropertyTable::new();
        t.collect(dry_run(c).expect("dry run"));
        t
    }

    fn spec() -> BlockSpec {
        BlockSpec::default()
            .input("position", Expr::var("k_p"))
            .output("outDistance", "k_d")
    }

    fn block_body(stmt: &Stmt) -> &[Stmt] {
        match stmt {
            Stmt::Block { body, .. } => body,
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn circle_reads_its_radius_from_the_claimed_slot() {
        let c = circle_2d("disk", 4.0);
        let t = table_for(&c);
        let lowered = lower_component(&c, &t, &spec()).expect("lower");
        let body = block_body(&lowered.stmt);
        assert_eq!(body[0], Stmt::let_("v_position", Expr::var("k_p")));
        assert_eq!(
            body[1],
            Stmt::Var {
                name: "v_outDistance".into(),
                ty: ValueType::F32,
                value: Some(Expr::var("k_d")),
            }
        );
        let radius_slot = t.slot(&SlotKey::literal("disk", &[0, 0, 1])).expect("slot");
        assert_eq!(
            body[2],
            Stmt::set(
                "v_outDistance",
                Expr::sub(
                    Expr::call(Builtin::Length, vec![Expr::var("v_position")]),
                    Expr::Property {
                        slot: radius_slot,
                        ty: ValueType::F32
                    }
                )
            )
        );
        assert_eq!(body.last(), Some(&Stmt::set("k_d", Expr::var("v_outDistance"))));
    }

    #[test]
    fn scalar_arguments_are_splatted_for_componentwise_builtins() {
        let c = box_2d("b", 1.0, 2.0);
        let t = table_for(&c);
        let lowered = lower_component(&c, &t, &spec()).expect("lower");
        let text = format!("{:?}", lowered.stmt);
        assert!(text.contains("Construct(Vec2, [Property"), "{text}");
    }

    #[test]
    fn unclaimed_literals_fail_loudly() {
        let c = circle_2d("disk", 4.0);
        let mut t = PropertyTable::new();
        for field in c.ordered_fields() {
            t.claim(SlotKey::field("disk", field), [0.0; 4]);
        }
        assert!(matches!(
            lower_component(&c, &t, &spec()),
            Err(BuildError::UnclaimedSlot { .. })
        ));
    }

    #[test]
    fn unknown_names_and_read_only_targets_are_rejected() {
        let c = Component::new("c", ComponentKind::Sdf2D).with_statement(Statement::assign(
            Fragment::out("outDistance", "float"),
            Fragment::variable("nowhere", "float"),
        ));
        assert!(matches!(
            lower_component(&c, &table_for(&c), &spec()),
            Err(BuildError::UnknownVariable { .. })
        ));

        let c = Component::new("c", ComponentKind::Sdf2D).with_statement(Statement::assign(
            Fragment::variable("position", "float2"),
            Fragment::scalar(1.0),
        ));
        assert!(matches!(
            lower_component(&c, &table_for(&c), &spec()),
            Err(BuildError::Type { .. })
        ));

        let c = Component::new("c", ComponentKind::Sdf2D).with_statement(Statement::assign(
            Fragment::out("outDistance", "float"),
            Fragment::call("texture", "float", vec![]),
        ));
        assert!(matches!(
            lower_component(&c, &table_for(&c), &spec()),
            Err(BuildError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn vector_width_mismatches_are_type_errors() {
        let c = Component::new("c", ComponentKind::Sdf2D).with_statement(Statement::define(
            "v",
            "float3",
            Fragment::variable("position", "float2"),
        ));
        assert!(matches!(
            lower_component(&c, &table_for(&c), &spec()),
            Err(BuildError::Type { .. })
        ));
    }

    #[test]
    fn captures_widen_the_tapped_variable() {
        let c = pinhole_camera_3d("cam");
        let t = table_for(&c);
        let spec = BlockSpec::default()
            .input("uv", Expr::var("k_uv"))
            .input("size", Expr::var("k_size"))
            .capture("forward", "k_monitor");
        let lowered = lower_component(&c, &t, &spec).expect("lower");
        assert_eq!(lowered.captured, Some(ValueType::Vec3));
        let body = block_body(&lowered.stmt);
        assert_eq!(
            body.last(),
            Some(&Stmt::set(
                "k_monitor",
                widen(Expr::var("v_forward"), ValueType::Vec3)
            ))
        );

        let missing = BlockSpec::default().capture("nothing", "k_monitor");
        assert!(matches!(
            lower_component(&c, &t, &missing),
            Err(BuildError::MonitorTargetMissing { .. })
        ));
    }

    #[test]
    fn single_component_assignment_uses_the_component_target() {
        let c = Component::new("c", ComponentKind::Colorize)
            .with_statement(Statement::assign(
                Fragment::out("outColor", "float4").with_qualifier("a"),
                Fragment::scalar(0.5),
            ));
        let lowered = lower_component(&c, &table_for(&c), &BlockSpec::default()).expect("lower");
        let body = block_body(&lowered.stmt);
        assert!(body.iter().any(|s| matches!(
            s,
            Stmt::Assign { target, component: Some('w'), .. } if target == "v_outColor"
        )));
    }
}
