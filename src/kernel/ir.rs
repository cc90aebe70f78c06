//! Typed kernel IR.
//!
//! Component bodies are lowered into this tree; the WGSL emitter and the CPU
//! interpreter both consume it. Every entry point runs once per output pixel and
//! sees two implicit values: `k_coord` (pixel coordinate) and `k_size` (output size).

use std::collections::{HashMap, HashSet};

use super::types::{TextureFormat, ValueType};
use crate::compiler::property::SlotId;

/// Implicit per-pixel coordinate (`vec2f`).
pub const COORD: &str = "k_coord";
/// Implicit output size (`vec2f`).
pub const SIZE: &str = "k_size";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn from_symbol(s: &str) -> Option<Self> {
        match s {
            "+" => Some(BinaryOp::Add),
            "-" => Some(BinaryOp::Sub),
            "*" => Some(BinaryOp::Mul),
            "/" => Some(BinaryOp::Div),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn apply(self, a: f32, b: f32) -> bool {
        match self {
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    pub fn symbol(self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }

    pub fn binary(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinaryOp::Add),
            AssignOp::Sub => Some(BinaryOp::Sub),
            AssignOp::Mul => Some(BinaryOp::Mul),
            AssignOp::Div => Some(BinaryOp::Div),
        }
    }
}

/// Built-in functions available to component bodies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    Abs,
    Sign,
    Floor,
    Ceil,
    Fract,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Atan2,
    Exp,
    Log,
    Pow,
    Min,
    Max,
    Clamp,
    Mix,
    Step,
    Smoothstep,
    Length,
    Distance,
    Dot,
    Cross,
    Normalize,
    Reflect,
    Radians,
}

impl Builtin {
    pub const ALL: [Builtin; 26] = [
        Builtin::Abs,
        Builtin::Sign,
        Builtin::Floor,
        Builtin::Ceil,
        Builtin::Fract,
        Builtin::Sqrt,
        Builtin::Sin,
        Builtin::Cos,
        Builtin::Tan,
        Builtin::Atan2,
        Builtin::Exp,
        Builtin::Log,
        Builtin::Pow,
        Builtin::Min,
        Builtin::Max,
        Builtin::Clamp,
        Builtin::Mix,
        Builtin::Step,
        Builtin::Smoothstep,
        Builtin::Length,
        Builtin::Distance,
        Builtin::Dot,
        Builtin::Cross,
        Builtin::Normalize,
        Builtin::Reflect,
        Builtin::Radians,
    ];

    /// Name used both in graph fragments and in WGSL.
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Abs => "abs",
            Builtin::Sign => "sign",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Fract => "fract",
            Builtin::Sqrt => "sqrt",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Atan2 => "atan2",
            Builtin::Exp => "exp",
            Builtin::Log => "log",
            Builtin::Pow => "pow",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Clamp => "clamp",
            Builtin::Mix => "mix",
            Builtin::Step => "step",
            Builtin::Smoothstep => "smoothstep",
            Builtin::Length => "length",
            Builtin::Distance => "distance",
            Builtin::Dot => "dot",
            Builtin::Cross => "cross",
            Builtin::Normalize => "normalize",
            Builtin::Reflect => "reflect",
            Builtin::Radians => "radians",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn arg_count(self) -> usize {
        match self {
            Builtin::Clamp | Builtin::Mix | Builtin::Smoothstep => 3,
            Builtin::Atan2
            | Builtin::Pow
            | Builtin::Min
            | Builtin::Max
            | Builtin::Step
            | Builtin::Distance
            | Builtin::Dot
            | Builtin::Cross
            | Builtin::Reflect => 2,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(f32),
    /// `vecNf(...)`; arguments are flattened component-wise.
    Construct(ValueType, Vec<Expr>),
    Var(String),
    /// Read of one property record, truncated to `ty`.
    Property { slot: SlotId, ty: ValueType },
    Swizzle(Box<Expr>, String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Builtin(Builtin, Vec<Expr>),
    Call(String, Vec<Expr>),
    /// Texel of a read binding at the current pixel (`vec4f`).
    Load(String),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn vec(ty: ValueType, parts: Vec<Expr>) -> Self {
        Expr::Construct(ty, parts)
    }

    pub fn swizzle(self, pattern: &str) -> Self {
        Expr::Swizzle(Box::new(self), pattern.to_string())
    }

    pub fn neg(self) -> Self {
        Expr::Neg(Box::new(self))
    }

    pub fn bin(op: BinaryOp, a: Expr, b: Expr) -> Self {
        Expr::Binary(op, Box::new(a), Box::new(b))
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::bin(BinaryOp::Add, a, b)
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::bin(BinaryOp::Sub, a, b)
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::bin(BinaryOp::Mul, a, b)
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Expr::bin(BinaryOp::Div, a, b)
    }

    pub fn cmp(op: CompareOp, a: Expr, b: Expr) -> Self {
        Expr::Compare(op, Box::new(a), Box::new(b))
    }

    pub fn or(a: Expr, b: Expr) -> Self {
        Expr::Or(Box::new(a), Box::new(b))
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::And(Box::new(a), Box::new(b))
    }

    pub fn call(b: Builtin, args: Vec<Expr>) -> Self {
        Expr::Builtin(b, args)
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call(name.into(), args)
    }

    pub fn load(binding: impl Into<String>) -> Self {
        Expr::Load(binding.into())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
    },
    Var {
        name: String,
        ty: ValueType,
        value: Option<Expr>,
    },
    Assign {
        target: String,
        component: Option<char>,
        op: AssignOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// `for (var counter: f32 = 0.0; counter < count; counter += 1.0)`
    Loop {
        counter: String,
        count: u32,
        body: Vec<Stmt>,
    },
    Break,
    Return(Option<Expr>),
    Block {
        label: Option<String>,
        body: Vec<Stmt>,
    },
    Store {
        binding: String,
        value: Expr,
    },
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            value,
        }
    }

    pub fn var(name: impl Into<String>, ty: ValueType, value: Expr) -> Self {
        Stmt::Var {
            name: name.into(),
            ty,
            value: Some(value),
        }
    }

    pub fn set(target: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            target: target.into(),
            component: None,
            op: AssignOp::Set,
            value,
        }
    }

    pub fn store(binding: impl Into<String>, value: Expr) -> Self {
        Stmt::Store {
            binding: binding.into(),
            value,
        }
    }

    pub fn when(cond: Expr, then: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then,
            otherwise: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub name: String,
    pub format: TextureFormat,
    pub access: Access,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<(String, ValueType)>,
    pub ret: ValueType,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub name: String,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub body: Vec<Stmt>,
}

/// One compilable unit: bindings, helper functions and entry points.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KernelModule {
    pub label: String,
    pub bindings: Vec<Binding>,
    pub functions: Vec<Function>,
    pub entries: Vec<EntryPoint>,
}

impl KernelModule {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Declare a binding once; later declarations with the same name are ignored.
    pub fn bind(&mut self, name: &str, format: TextureFormat, access: Access) {
        if self.binding(name).is_none() {
            self.bindings.push(Binding {
                name: name.to_string(),
                format,
                access,
            });
        }
    }

    pub fn binding(&self, name: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn entry(&self, name: &str) -> Option<&EntryPoint> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Structural checks: bindings exist with the right access, every call
    /// resolves, and every variable is declared before use.
    pub fn verify(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for b in &self.bindings {
            if !seen.insert(b.name.as_str()) {
                return Err(format!("duplicate binding '{}'", b.name));
            }
        }
        for f in &self.functions {
            let mut scope = Scope::default();
            scope.push();
            for (p, _) in &f.params {
                scope.declare(p);
            }
            let ctx = VerifyCtx {
                module: self,
                reads: None,
                writes: None,
                owner: &f.name,
            };
            ctx.block(&f.body, &mut scope, false)?;
        }
        for e in &self.entries {
            if e.writes.is_empty() {
                return Err(format!("entry '{}' writes no texture", e.name));
            }
            for r in &e.reads {
                match self.binding(r) {
                    Some(b) if b.access == Access::Read => {}
                    _ => return Err(format!("entry '{}' reads undeclared binding '{r}'", e.name)),
                }
            }
            for w in &e.writes {
                match self.binding(w) {
                    Some(b) if b.access == Access::Write => {}
                    _ => {
                        return Err(format!("entry '{}' writes undeclared binding '{w}'", e.name));
                    }
                }
            }
            let mut scope = Scope::default();
            scope.push();
            scope.declare(COORD);
            scope.declare(SIZE);
            let ctx = VerifyCtx {
                module: self,
                reads: Some(&e.reads),
                writes: Some(&e.writes),
                owner: &e.name,
            };
            ctx.block(&e.body, &mut scope, false)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Scope {
    frames: Vec<HashSet<String>>,
}

impl Scope {
    fn push(&mut self) {
        self.frames.push(HashSet::new());
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn declare(&mut self, name: &str) {
        if let Some(top) = self.frames.last_mut() {
            top.insert(name.to_string());
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.frames.iter().rev().any(|f| f.contains(name))
    }
}

struct VerifyCtx<'a> {
    module: &'a KernelModule,
    reads: Option<&'a Vec<String>>,
    writes: Option<&'a Vec<String>>,
    owner: &'a str,
}

impl VerifyCtx<'_> {
    fn block(&self, body: &[Stmt], scope: &mut Scope, in_loop: bool) -> Result<(), String> {
        scope.push();
        let out = body.iter().try_for_each(|s| self.stmt(s, scope, in_loop));
        scope.pop();
        out
    }

    fn stmt(&self, stmt: &Stmt, scope: &mut Scope, in_loop: bool) -> Result<(), String> {
        match stmt {
            Stmt::Let { name, value } => {
                self.expr(value, scope)?;
                scope.declare(name);
            }
            Stmt::Var { name, value, .. } => {
                if let Some(v) = value {
                    self.expr(v, scope)?;
                }
                scope.declare(name);
            }
            Stmt::Assign { target, value, .. } => {
                if !scope.contains(target) {
                    return Err(format!("{}: assignment to undeclared '{target}'", self.owner));
                }
                self.expr(value, scope)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.expr(cond, scope)?;
                self.block(then, scope, in_loop)?;
                self.block(otherwise, scope, in_loop)?;
            }
            Stmt::Loop { counter, body, .. } => {
                scope.push();
                scope.declare(counter);
                let out = self.block(body, scope, true);
                scope.pop();
                out?;
            }
            Stmt::Break => {
                if !in_loop {
                    return Err(format!("{}: break outside of a loop", self.owner));
                }
            }
            Stmt::Return(value) => {
                if let Some(v) = value {
                    self.expr(v, scope)?;
                }
            }
            Stmt::Block { body, .. } => self.block(body, scope, in_loop)?,
            Stmt::Store { binding, value } => {
                let Some(writes) = self.writes else {
                    return Err(format!("{}: texture store inside a helper function", self.owner));
                };
                if !writes.iter().any(|w| w == binding) {
                    return Err(format!("{}: store to undeclared output '{binding}'", self.owner));
                }
                self.expr(value, scope)?;
            }
        }
        Ok(())
    }

    fn expr(&self, expr: &Expr, scope: &Scope) -> Result<(), String> {
        match expr {
            Expr::Const(_) | Expr::Property { .. } => Ok(()),
            Expr::Var(name) => {
                if scope.contains(name) {
                    Ok(())
                } else {
                    Err(format!("{}: undeclared variable '{name}'", self.owner))
                }
            }
            Expr::Construct(_, parts) | Expr::Builtin(_, parts) => {
                parts.iter().try_for_each(|p| self.expr(p, scope))
            }
            Expr::Call(name, args) => {
                let Some(f) = self.module.function(name) else {
                    return Err(format!("{}: call to unknown function '{name}'", self.owner));
                };
                if f.params.len() != args.len() {
                    return Err(format!(
                        "{}: '{name}' takes {} arguments, got {}",
                        self.owner,
                        f.params.len(),
                        args.len()
                    ));
                }
                args.iter().try_for_each(|p| self.expr(p, scope))
            }
            Expr::Swizzle(inner, _) | Expr::Neg(inner) => self.expr(inner, scope),
            Expr::Binary(_, a, b)
            | Expr::Compare(_, a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b) => {
                self.expr(a, scope)?;
                self.expr(b, scope)
            }
            Expr::Load(binding) => {
                let Some(reads) = self.reads else {
                    return Err(format!("{}: texture load inside a helper function", self.owner));
                };
                if reads.iter().any(|r| r == binding) {
                    Ok(())
                } else {
                    Err(format!("{}: load from undeclared input '{binding}'", self.owner))
                }
            }
        }
    }
}

/// WGSL binding index of each texture. Index 0 is the property buffer.
pub fn binding_slots(module: &KernelModule) -> HashMap<&str, u32> {
    module
        .bindings
        .iter()
        .enumerate()
        .map(|(i, b)| (b.name.as_str(), i as u32 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_with_entry(body: Vec<Stmt>) -> KernelModule {
        let mut m = KernelModule::new("test");
        m.bind("src", TextureFormat::Rgba32Float, Access::Read);
        m.bind("out", TextureFormat::Rgba32Float, Access::Write);
        m.entries.push(EntryPoint {
            name: "main".into(),
            reads: vec!["src".into()],
            writes: vec!["out".into()],
            body,
        });
        m
    }

    #[test]
    fn builtin_names_resolve_both_ways() {
        for b in Builtin::ALL {
            assert_eq!(Builtin::from_name(b.name()), Some(b));
        }
        assert_eq!(Builtin::from_name("texture"), None);
    }

    #[test]
    fn verify_accepts_a_well_formed_entry() {
        let m = module_with_entry(vec![
            Stmt::let_("k_a", Expr::load("src")),
            Stmt::store("out", Expr::var("k_a")),
        ]);
        assert_eq!(m.verify(), Ok(()));
    }

    #[test]
    fn verify_rejects_undeclared_variables_and_bindings() {
        let m = module_with_entry(vec![Stmt::store("out", Expr::var("missing"))]);
        assert!(m.verify().unwrap_err().contains("missing"));

        let m = module_with_entry(vec![Stmt::store("elsewhere", Expr::Const(1.0))]);
        assert!(m.verify().unwrap_err().contains("elsewhere"));

        let m = module_with_entry(vec![Stmt::Break]);
        assert!(m.verify().unwrap_err().contains("break"));
    }

    #[test]
    fn block_scoped_names_do_not_leak() {
        let m = module_with_entry(vec![
            Stmt::Block {
                label: None,
                body: vec![Stmt::let_("k_inner", Expr::Const(1.0))],
            },
            Stmt::store("out", Expr::var("k_inner")),
        ]);
        assert!(m.verify().is_err());
    }
}
