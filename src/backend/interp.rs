//! Per-pixel interpreter of kernel IR.
//!
//! Follows WGSL semantics for the subset the compiler emits: scalar operands
//! broadcast over vectors, comparisons are scalar, loops count in `f32`.

use crate::compiler::property::Record;
use crate::kernel::ir::{
    AssignOp, Builtin, COORD, EntryPoint, Expr, Function, KernelModule, SIZE, Stmt,
};
use crate::kernel::types::ValueType;

const MAX_CALL_DEPTH: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Num { len: usize, c: [f32; 4] },
    Bool(bool),
}

impl Value {
    pub fn scalar(v: f32) -> Self {
        Value::Num {
            len: 1,
            c: [v, 0.0, 0.0, 0.0],
        }
    }

    pub fn from_slice(values: &[f32]) -> Self {
        let mut c = [0.0; 4];
        let len = values.len().min(4);
        c[..len].copy_from_slice(&values[..len]);
        Value::Num { len, c }
    }

    pub fn zero(ty: ValueType) -> Self {
        Value::Num {
            len: ty.arity(),
            c: [0.0; 4],
        }
    }

    fn num(self) -> Result<(usize, [f32; 4]), String> {
        match self {
            Value::Num { len, c } => Ok((len, c)),
            Value::Bool(_) => Err("expected a number, found a bool".into()),
        }
    }

    fn boolean(self) -> Result<bool, String> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Num { .. } => Err("expected a bool, found a number".into()),
        }
    }

    fn as_scalar(self) -> Result<f32, String> {
        match self.num()? {
            (1, c) => Ok(c[0]),
            (len, _) => Err(format!("expected a scalar, found a {len}-vector")),
        }
    }

    pub fn components(&self) -> &[f32] {
        match self {
            Value::Num { len, c } => &c[..*len],
            Value::Bool(_) => &[],
        }
    }

    fn map1(self, f: impl Fn(f32) -> f32) -> Result<Value, String> {
        let (len, mut c) = self.num()?;
        for v in c.iter_mut().take(len) {
            *v = f(*v);
        }
        Ok(Value::Num { len, c })
    }

    fn map2(a: Value, b: Value, f: impl Fn(f32, f32) -> f32) -> Result<Value, String> {
        let (la, ca) = a.num()?;
        let (lb, cb) = b.num()?;
        let len = broadcast_len(&[la, lb])?;
        let mut c = [0.0; 4];
        for (i, v) in c.iter_mut().enumerate().take(len) {
            *v = f(pick(la, &ca, i), pick(lb, &cb, i));
        }
        Ok(Value::Num { len, c })
    }

    fn map3(a: Value, b: Value, t: Value, f: impl Fn(f32, f32, f32) -> f32) -> Result<Value, String> {
        let (la, ca) = a.num()?;
        let (lb, cb) = b.num()?;
        let (lt, ct) = t.num()?;
        let len = broadcast_len(&[la, lb, lt])?;
        let mut c = [0.0; 4];
        for (i, v) in c.iter_mut().enumerate().take(len) {
            *v = f(pick(la, &ca, i), pick(lb, &cb, i), pick(lt, &ct, i));
        }
        Ok(Value::Num { len, c })
    }
}

fn pick(len: usize, c: &[f32; 4], i: usize) -> f32 {
    if len == 1 { c[0] } else { c[i] }
}

fn broadcast_len(lens: &[usize]) -> Result<usize, String> {
    let widest = lens.iter().copied().max().unwrap_or(1);
    if lens.iter().all(|l| *l == 1 || *l == widest) {
        Ok(widest)
    } else {
        Err(format!("operand sizes {lens:?} do not broadcast"))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn smoothstep(e0: f32, e1: f32, x: f32) -> f32 {
    let t = ((x - e0) / (e1 - e0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn swizzle_index(ch: char) -> Option<usize> {
    match ch {
        'x' | 'r' => Some(0),
        'y' | 'g' => Some(1),
        'z' | 'b' => Some(2),
        'w' | 'a' => Some(3),
        _ => None,
    }
}

fn builtin(b: Builtin, args: &[Value]) -> Result<Value, String> {
    if args.len() != b.arg_count() {
        return Err(format!(
            "{} takes {} arguments, got {}",
            b.name(),
            b.arg_count(),
            args.len()
        ));
    }
    let a = args[0];
    match b {
        Builtin::Abs => a.map1(f32::abs),
        Builtin::Sign => a.map1(sign),
        Builtin::Floor => a.map1(f32::floor),
        Builtin::Ceil => a.map1(f32::ceil),
        Builtin::Fract => a.map1(|v| v - v.floor()),
        Builtin::Sqrt => a.map1(f32::sqrt),
        Builtin::Sin => a.map1(f32::sin),
        Builtin::Cos => a.map1(f32::cos),
        Builtin::Tan => a.map1(f32::tan),
        Builtin::Exp => a.map1(f32::exp),
        Builtin::Log => a.map1(f32::ln),
        Builtin::Radians => a.map1(f32::to_radians),
        Builtin::Atan2 => Value::map2(a, args[1], f32::atan2),
        Builtin::Pow => Value::map2(a, args[1], f32::powf),
        Builtin::Min => Value::map2(a, args[1], f32::min),
        Builtin::Max => Value::map2(a, args[1], f32::max),
        Builtin::Step => Value::map2(a, args[1], |edge, x| if x >= edge { 1.0 } else { 0.0 }),
        Builtin::Clamp => Value::map3(a, args[1], args[2], |x, lo, hi| x.max(lo).min(hi)),
        Builtin::Mix => Value::map3(a, args[1], args[2], |x, y, t| x + (y - x) * t),
        Builtin::Smoothstep => Value::map3(a, args[1], args[2], smoothstep),
        Builtin::Length => Ok(Value::scalar(dot(a.components(), a.components()).sqrt())),
        Builtin::Distance => {
            let d = Value::map2(a, args[1], |x, y| x - y)?;
            Ok(Value::scalar(dot(d.components(), d.components()).sqrt()))
        }
        Builtin::Dot => {
            let (la, _) = a.num()?;
            let (lb, _) = args[1].num()?;
            if la != lb {
                return Err("dot of mismatched vectors".into());
            }
            Ok(Value::scalar(dot(a.components(), args[1].components())))
        }
        Builtin::Cross => {
            let (x, y) = (a.components(), args[1].components());
            if x.len() != 3 || y.len() != 3 {
                return Err("cross needs two 3-vectors".into());
            }
            Ok(Value::from_slice(&[
                x[1] * y[2] - x[2] * y[1],
                x[2] * y[0] - x[0] * y[2],
                x[0] * y[1] - x[1] * y[0],
            ]))
        }
        Builtin::Normalize => {
            let len = dot(a.components(), a.components()).sqrt();
            a.map1(|v| v / len)
        }
        Builtin::Reflect => {
            let n = args[1];
            let d = dot(n.components(), a.components());
            Value::map2(a, n, |i, n| i - 2.0 * d * n)
        }
    }
}

enum Flow {
    Next,
    Break,
    Return(Option<Value>),
}

/// Inputs of one invocation.
pub struct Pixel<'p> {
    pub coord: [f32; 2],
    pub size: [f32; 2],
    /// Texel of every read binding at this pixel.
    pub texels: &'p [(&'p str, [f32; 4])],
}

struct Machine<'m, 'p> {
    module: &'m KernelModule,
    data: &'m [Record],
    pixel: &'p Pixel<'p>,
    vars: Vec<(&'m str, Value)>,
    base: usize,
    depth: usize,
    stores: Vec<(&'m str, [f32; 4])>,
}

/// Run `entry` for one pixel and return its texture stores in order.
pub fn run_entry<'m>(
    module: &'m KernelModule,
    entry: &'m EntryPoint,
    data: &'m [Record],
    pixel: &Pixel<'_>,
) -> Result<Vec<(&'m str, [f32; 4])>, String> {
    let mut m = Machine {
        module,
        data,
        pixel,
        vars: vec![
            (COORD, Value::from_slice(&pixel.coord)),
            (SIZE, Value::from_slice(&pixel.size)),
        ],
        base: 0,
        depth: 0,
        stores: Vec::new(),
    };
    m.block(&entry.body)?;
    Ok(m.stores)
}

impl<'m> Machine<'m, '_> {
    fn lookup(&self, name: &str) -> Result<Value, String> {
        self.vars[self.base..]
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| format!("undeclared variable '{name}'"))
    }

    fn slot_of(&self, name: &str) -> Result<usize, String> {
        self.vars[self.base..]
            .iter()
            .rposition(|(n, _)| *n == name)
            .map(|i| i + self.base)
            .ok_or_else(|| format!("assignment to undeclared '{name}'"))
    }

    fn block(&mut self, body: &'m [Stmt]) -> Result<Flow, String> {
        let mark = self.vars.len();
        let mut flow = Flow::Next;
        for s in body {
            flow = self.stmt(s)?;
            if !matches!(flow, Flow::Next) {
                break;
            }
        }
        self.vars.truncate(mark);
        Ok(flow)
    }

    fn stmt(&mut self, stmt: &'m Stmt) -> Result<Flow, String> {
        match stmt {
            Stmt::Let { name, value } => {
                let v = self.expr(value)?;
                self.vars.push((name.as_str(), v));
            }
            Stmt::Var { name, ty, value } => {
                let v = match value {
                    Some(e) => self.expr(e)?,
                    None => Value::zero(*ty),
                };
                self.vars.push((name.as_str(), v));
            }
            Stmt::Assign {
                target,
                component,
                op,
                value,
            } => {
                let rhs = self.expr(value)?;
                let slot = self.slot_of(target)?;
                let current = self.vars[slot].1;
                let updated = match component {
                    None => apply_assign(*op, current, rhs)?,
                    Some(ch) => {
                        let i = swizzle_index(*ch).ok_or_else(|| format!("bad component '{ch}'"))?;
                        let (len, mut c) = current.num()?;
                        if i >= len {
                            return Err(format!("component '{ch}' out of range"));
                        }
                        let lane = apply_assign(*op, Value::scalar(c[i]), rhs)?.as_scalar()?;
                        c[i] = lane;
                        Value::Num { len, c }
                    }
                };
                self.vars[slot].1 = updated;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let taken = if self.expr(cond)?.boolean()? { then } else { otherwise };
                return self.block(taken);
            }
            Stmt::Loop {
                counter,
                count,
                body,
            } => {
                let mark = self.vars.len();
                self.vars.push((counter.as_str(), Value::scalar(0.0)));
                let mut out = Flow::Next;
                for i in 0..*count {
                    self.vars[mark].1 = Value::scalar(i as f32);
                    match self.block(body)? {
                        Flow::Next => {}
                        Flow::Break => break,
                        ret @ Flow::Return(_) => {
                            out = ret;
                            break;
                        }
                    }
                }
                self.vars.truncate(mark);
                return Ok(out);
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Return(value) => {
                let v = value.as_ref().map(|e| self.expr(e)).transpose()?;
                return Ok(Flow::Return(v));
            }
            Stmt::Block { body, .. } => return self.block(body),
            Stmt::Store { binding, value } => {
                let v = self.expr(value)?;
                let (len, c) = v.num()?;
                if len != 4 {
                    return Err(format!("store to '{binding}' needs a vec4, found {len} lanes"));
                }
                self.stores.push((binding.as_str(), c));
            }
        }
        Ok(Flow::Next)
    }

    fn expr(&mut self, e: &'m Expr) -> Result<Value, String> {
        match e {
            Expr::Const(v) => Ok(Value::scalar(*v)),
            Expr::Construct(ty, parts) => {
                let mut flat = Vec::with_capacity(4);
                for p in parts {
                    let (len, c) = self.expr(p)?.num()?;
                    flat.extend_from_slice(&c[..len]);
                }
                let n = ty.arity();
                if flat.len() == 1 {
                    Ok(Value::from_slice(&[flat[0]; 4][..n]))
                } else if flat.len() == n {
                    Ok(Value::from_slice(&flat))
                } else {
                    Err(format!("{} built from {} values", ty.wgsl(), flat.len()))
                }
            }
            Expr::Var(name) => self.lookup(name),
            Expr::Property { slot, ty } => {
                let record = self.data.get(*slot).copied().unwrap_or([0.0; 4]);
                Ok(Value::from_slice(&record[..ty.arity()]))
            }
            Expr::Swizzle(inner, pattern) => {
                let (len, c) = self.expr(inner)?.num()?;
                let mut out = Vec::with_capacity(pattern.len());
                for ch in pattern.chars() {
                    match swizzle_index(ch) {
                        Some(i) if i < len => out.push(c[i]),
                        _ => return Err(format!("bad swizzle '.{pattern}' on {len} lanes")),
                    }
                }
                Ok(Value::from_slice(&out))
            }
            Expr::Neg(inner) => self.expr(inner)?.map1(|v| -v),
            Expr::Binary(op, a, b) => {
                let (a, b) = (self.expr(a)?, self.expr(b)?);
                Value::map2(a, b, |x, y| op.apply(x, y))
            }
            Expr::Compare(op, a, b) => {
                let a = self.expr(a)?.as_scalar()?;
                let b = self.expr(b)?.as_scalar()?;
                Ok(Value::Bool(op.apply(a, b)))
            }
            Expr::And(a, b) => {
                if !self.expr(a)?.boolean()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.expr(b)?.boolean()?))
            }
            Expr::Or(a, b) => {
                if self.expr(a)?.boolean()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.expr(b)?.boolean()?))
            }
            Expr::Builtin(b, args) => {
                let values = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin(*b, &values)
            }
            Expr::Call(name, args) => {
                let f = self
                    .module
                    .function(name)
                    .ok_or_else(|| format!("unknown function '{name}'"))?;
                let values = args
                    .iter()
                    .map(|a| self.expr(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(f, values)
            }
            Expr::Load(binding) => self
                .pixel
                .texels
                .iter()
                .find(|(n, _)| *n == binding.as_str())
                .map(|(_, t)| Value::from_slice(t))
                .ok_or_else(|| format!("load from unbound '{binding}'")),
        }
    }

    fn call(&mut self, f: &'m Function, args: Vec<Value>) -> Result<Value, String> {
        if args.len() != f.params.len() {
            return Err(format!("'{}' called with {} arguments", f.name, args.len()));
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(format!("call depth exceeded in '{}'", f.name));
        }
        let (saved_base, mark) = (self.base, self.vars.len());
        self.base = mark;
        self.depth += 1;
        for ((name, _), v) in f.params.iter().zip(args) {
            self.vars.push((name.as_str(), v));
        }
        let flow = self.block(&f.body);
        self.depth -= 1;
        self.vars.truncate(mark);
        self.base = saved_base;
        match flow? {
            Flow::Return(Some(v)) => Ok(v),
            _ => Err(format!("'{}' finished without a value", f.name)),
        }
    }
}

fn apply_assign(op: AssignOp, current: Value, rhs: Value) -> Result<Value, String> {
    match op.binary() {
        None => Ok(rhs),
        Some(bin) => Value::map2(current, rhs, |a, b| bin.apply(a, b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ir::{Access, BinaryOp, CompareOp};
    use crate::kernel::types::TextureFormat;

    fn run(body: Vec<Stmt>, functions: Vec<Function>) -> Result<[f32; 4], String> {
        let mut m = KernelModule::new("t");
        m.bind("src", TextureFormat::Rgba32Float, Access::Read);
        m.bind("out", TextureFormat::Rgba32Float, Access::Write);
        m.functions = functions;
        m.entries.push(EntryPoint {
            name: "main".into(),
            reads: vec!["src".into()],
            writes: vec!["out".into()],
            body,
        });
        let data = [[0.0; 4], [2.0, 3.0, 4.0, 5.0]];
        let texels = [("src", [0.5, 0.25, 0.0, 1.0])];
        let pixel = Pixel {
            coord: [3.0, 1.0],
            size: [8.0, 4.0],
            texels: &texels,
        };
        let entry = &m.entries[0];
        let stores = run_entry(&m, entry, &data, &pixel)?;
        Ok(stores.last().map(|(_, v)| *v).unwrap_or([f32::NAN; 4]))
    }

    fn v4(parts: Vec<Expr>) -> Expr {
        Expr::vec(ValueType::Vec4, parts)
    }

    #[test]
    fn scalars_broadcast_and_vectors_splat() {
        let out = run(
            vec![Stmt::store(
                "out",
                Expr::mul(v4(vec![Expr::Const(1.0)]), Expr::Const(3.0)),
            )],
            vec![],
        );
        assert_eq!(out, Ok([3.0; 4]));
    }

    #[test]
    fn properties_coords_and_loads_are_visible() {
        let out = run(
            vec![Stmt::store(
                "out",
                v4(vec![
                    Expr::Property {
                        slot: 1,
                        ty: ValueType::F32,
                    },
                    Expr::var(COORD),
                    Expr::load("src").swizzle("y"),
                ]),
            )],
            vec![],
        );
        assert_eq!(out, Ok([2.0, 3.0, 1.0, 0.25]));
    }

    #[test]
    fn loops_break_and_functions_return() {
        let double = Function {
            name: "k_double".into(),
            params: vec![("k_x".into(), ValueType::F32)],
            ret: ValueType::F32,
            body: vec![Stmt::Return(Some(Expr::mul(Expr::var("k_x"), Expr::Const(2.0))))],
        };
        let body = vec![
            Stmt::var("k_acc", ValueType::F32, Expr::Const(0.0)),
            Stmt::Loop {
                counter: "k_i".into(),
                count: 10,
                body: vec![
                    Stmt::when(
                        Expr::cmp(CompareOp::Ge, Expr::var("k_i"), Expr::Const(3.0)),
                        vec![Stmt::Break],
                    ),
                    Stmt::set(
                        "k_acc",
                        Expr::add(Expr::var("k_acc"), Expr::func("k_double", vec![Expr::var("k_i")])),
                    ),
                ],
            },
            Stmt::store("out", v4(vec![Expr::var("k_acc")])),
        ];
        assert_eq!(run(body, vec![double]), Ok([6.0; 4]));
    }

    #[test]
    fn functions_cannot_see_caller_locals() {
        let leak = Function {
            name: "k_leak".into(),
            params: vec![],
            ret: ValueType::F32,
            body: vec![Stmt::Return(Some(Expr::var("k_local")))],
        };
        let body = vec![
            Stmt::let_("k_local", Expr::Const(1.0)),
            Stmt::store("out", v4(vec![Expr::func("k_leak", vec![])])),
        ];
        assert!(run(body, vec![leak]).unwrap_err().contains("k_local"));
    }

    #[test]
    fn component_assignment_and_compound_ops() {
        let body = vec![
            Stmt::var("k_v", ValueType::Vec4, v4(vec![Expr::Const(1.0)])),
            Stmt::Assign {
                target: "k_v".into(),
                component: Some('y'),
                op: AssignOp::Add,
                value: Expr::Const(4.0),
            },
            Stmt::Assign {
                target: "k_v".into(),
                component: None,
                op: AssignOp::Mul,
                value: Expr::Const(2.0),
            },
            Stmt::store("out", Expr::var("k_v")),
        ];
        assert_eq!(run(body, vec![]), Ok([2.0, 10.0, 2.0, 2.0]));
    }

    #[test]
    fn builtins_follow_wgsl() {
        let s = |v: f32| Value::scalar(v);
        assert_eq!(builtin(Builtin::Sign, &[s(0.0)]), Ok(s(0.0)));
        assert_eq!(builtin(Builtin::Step, &[s(1.0), s(1.0)]), Ok(s(1.0)));
        assert_eq!(builtin(Builtin::Smoothstep, &[s(0.0), s(2.0), s(1.0)]), Ok(s(0.5)));
        let v = Value::from_slice(&[3.0, 4.0]);
        assert_eq!(builtin(Builtin::Length, &[v]), Ok(s(5.0)));
        let mixed = builtin(
            Builtin::Mix,
            &[Value::from_slice(&[0.0, 10.0]), Value::from_slice(&[1.0, 20.0]), s(0.5)],
        );
        assert_eq!(mixed, Ok(Value::from_slice(&[0.5, 15.0])));
        let cross = builtin(
            Builtin::Cross,
            &[Value::from_slice(&[1.0, 0.0, 0.0]), Value::from_slice(&[0.0, 1.0, 0.0])],
        );
        assert_eq!(cross, Ok(Value::from_slice(&[0.0, 0.0, 1.0])));
        assert!(builtin(Builtin::Min, &[Value::from_slice(&[1.0, 2.0]), Value::from_slice(&[1.0, 2.0, 3.0])]).is_err());
    }

    #[test]
    fn non_vec4_stores_fault() {
        let body = vec![Stmt::store("out", Expr::Const(1.0))];
        assert!(run(body, vec![]).is_err());
        let bad = Expr::bin(BinaryOp::Add, Expr::var("nope"), Expr::Const(1.0));
        assert!(run(vec![Stmt::store("out", bad)], vec![]).is_err());
    }
}
