//! WGSL text emission for kernel modules.

use std::fmt::Write as _;
use std::ops::Range;

use super::ir::{Access, EntryPoint, Expr, Function, KernelModule, Stmt};
use super::types::ValueType;
use super::utils::{fmt_f32, texture_ident};

/// Name of the property buffer in emitted WGSL.
pub const DATA_IDENT: &str = "k_data";
pub const WORKGROUP_SIZE: u32 = 8;

/// Emitted source plus the line span (1-based, inclusive start, exclusive end)
/// of every labeled block, in emission order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmittedModule {
    pub text: String,
    pub spans: Vec<(String, Range<usize>)>,
}

impl EmittedModule {
    pub fn span_of(&self, label: &str) -> Option<Range<usize>> {
        self.spans
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, r)| r.clone())
    }
}

pub fn emit_module(module: &KernelModule) -> EmittedModule {
    let mut w = Writer::default();
    w.line(&format!("// kernel: {}", module.label));
    w.line(&format!(
        "@group(0) @binding(0) var<storage, read> {DATA_IDENT}: array<vec4f>;"
    ));
    for (i, b) in module.bindings.iter().enumerate() {
        let ty = match b.access {
            Access::Read => "texture_2d<f32>".to_string(),
            Access::Write => format!("texture_storage_2d<{}, write>", b.format.wgsl()),
        };
        w.line(&format!(
            "@group(0) @binding({}) var {}: {ty};",
            i + 1,
            texture_ident(&b.name)
        ));
    }
    for f in &module.functions {
        w.line("");
        emit_function(&mut w, f);
    }
    for e in &module.entries {
        w.line("");
        emit_entry(&mut w, e);
    }
    EmittedModule {
        text: w.out,
        spans: w.spans,
    }
}

pub fn emit_wgsl(module: &KernelModule) -> String {
    emit_module(module).text
}

#[derive(Default)]
struct Writer {
    out: String,
    indent: usize,
    lines: usize,
    spans: Vec<(String, Range<usize>)>,
}

impl Writer {
    fn line(&mut self, s: &str) {
        if !s.is_empty() {
            for _ in 0..self.indent {
                self.out.push_str("    ");
            }
            self.out.push_str(s);
        }
        self.out.push('\n');
        self.lines += 1;
    }

    fn next_line(&self) -> usize {
        self.lines + 1
    }
}

fn emit_function(w: &mut Writer, f: &Function) {
    let params: Vec<String> = f
        .params
        .iter()
        .map(|(n, ty)| format!("{n}: {}", ty.wgsl()))
        .collect();
    w.line(&format!(
        "fn {}({}) -> {} {{",
        f.name,
        params.join(", "),
        f.ret.wgsl()
    ));
    w.indent += 1;
    for s in &f.body {
        emit_stmt(w, s);
    }
    w.indent -= 1;
    w.line("}");
}

fn emit_entry(w: &mut Writer, e: &EntryPoint) {
    let sizing = e.writes.first().map(|b| texture_ident(b)).unwrap_or_default();
    w.line(&format!(
        "@compute @workgroup_size({WORKGROUP_SIZE}, {WORKGROUP_SIZE}, 1)"
    ));
    w.line(&format!(
        "fn {}(@builtin(global_invocation_id) k_global_id: vec3u) {{",
        e.name
    ));
    w.indent += 1;
    w.line(&format!("let k_dims = textureDimensions({sizing});"));
    w.line("if (k_global_id.x >= k_dims.x || k_global_id.y >= k_dims.y) {");
    w.line("    return;");
    w.line("}");
    w.line("let k_gid = vec2i(k_global_id.xy);");
    w.line("let k_coord = vec2f(k_global_id.xy);");
    w.line("let k_size = vec2f(k_dims);");
    for s in &e.body {
        emit_stmt(w, s);
    }
    w.indent -= 1;
    w.line("}");
}

fn emit_body(w: &mut Writer, body: &[Stmt]) {
    w.indent += 1;
    for s in body {
        emit_stmt(w, s);
    }
    w.indent -= 1;
}

fn emit_stmt(w: &mut Writer, stmt: &Stmt) {
    match stmt {
        Stmt::Let { name, value } => w.line(&format!("let {name} = {};", expr(value))),
        Stmt::Var { name, ty, value } => match value {
            Some(v) => w.line(&format!("var {name}: {} = {};", ty.wgsl(), expr(v))),
            None => w.line(&format!("var {name}: {};", ty.wgsl())),
        },
        Stmt::Assign {
            target,
            component,
            op,
            value,
        } => {
            let target = match component {
                Some(c) => format!("{target}.{c}"),
                None => target.clone(),
            };
            w.line(&format!("{target} {} {};", op.symbol(), expr(value)));
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            w.line(&format!("if ({}) {{", expr(cond)));
            emit_body(w, then);
            if otherwise.is_empty() {
                w.line("}");
            } else {
                w.line("} else {");
                emit_body(w, otherwise);
                w.line("}");
            }
        }
        Stmt::Loop {
            counter,
            count,
            body,
        } => {
            w.line(&format!(
                "for (var {counter}: f32 = 0.0; {counter} < {}; {counter} = {counter} + 1.0) {{",
                fmt_f32(*count as f32)
            ));
            emit_body(w, body);
            w.line("}");
        }
        Stmt::Break => w.line("break;"),
        Stmt::Return(None) => w.line("return;"),
        Stmt::Return(Some(v)) => w.line(&format!("return {};", expr(v))),
        Stmt::Block { label, body } => {
            if let Some(label) = label {
                w.line(&format!("// {label}"));
            }
            let start = w.next_line();
            w.line("{");
            emit_body(w, body);
            w.line("}");
            if let Some(label) = label {
                let end = w.next_line();
                w.spans.push((label.clone(), start..end));
            }
        }
        Stmt::Store { binding, value } => w.line(&format!(
            "textureStore({}, k_gid, {});",
            texture_ident(binding),
            expr(value)
        )),
    }
}

fn expr(e: &Expr) -> String {
    match e {
        Expr::Const(v) => {
            let s = fmt_f32(*v);
            if s.starts_with('-') { format!("({s})") } else { s }
        }
        Expr::Construct(ty, parts) => {
            let ctor = match ty {
                ValueType::F32 => "f32",
                other => other.wgsl(),
            };
            format!("{ctor}({})", list(parts))
        }
        Expr::Var(name) => name.clone(),
        Expr::Property { slot, ty } => {
            let swizzle = match ty {
                ValueType::F32 => ".x",
                ValueType::Vec2 => ".xy",
                ValueType::Vec3 => ".xyz",
                ValueType::Vec4 => "",
            };
            format!("{DATA_IDENT}[{slot}]{swizzle}")
        }
        Expr::Swizzle(inner, pattern) => format!("({}).{pattern}", expr(inner)),
        Expr::Neg(inner) => format!("(-{})", expr(inner)),
        Expr::Binary(op, a, b) => format!("({} {} {})", expr(a), op.symbol(), expr(b)),
        Expr::Compare(op, a, b) => format!("({} {} {})", expr(a), op.symbol(), expr(b)),
        Expr::And(a, b) => format!("({} && {})", expr(a), expr(b)),
        Expr::Or(a, b) => format!("({} || {})", expr(a), expr(b)),
        Expr::Builtin(b, args) => format!("{}({})", b.name(), list(args)),
        Expr::Call(name, args) => format!("{name}({})", list(args)),
        Expr::Load(binding) => format!("textureLoad({}, k_gid, 0)", texture_ident(binding)),
    }
}

fn list(parts: &[Expr]) -> String {
    let mut out = String::new();
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", expr(p));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ir::{Binding, BinaryOp, Builtin};
    use crate::kernel::types::TextureFormat;
    use crate::kernel::validation::validate_wgsl;

    fn sample_module() -> KernelModule {
        let mut m = KernelModule::new("sample");
        m.bindings.push(Binding {
            name: "depth".into(),
            format: TextureFormat::Rgba32Float,
            access: Access::Read,
        });
        m.bindings.push(Binding {
            name: "out_depth".into(),
            format: TextureFormat::Rgba32Float,
            access: Access::Write,
        });
        m.functions.push(Function {
            name: "k_map".into(),
            params: vec![("k_p".into(), ValueType::Vec2)],
            ret: ValueType::F32,
            body: vec![
                Stmt::Block {
                    label: Some("component circle".into()),
                    body: vec![Stmt::var(
                        "v_r",
                        ValueType::F32,
                        Expr::Property {
                            slot: 1,
                            ty: ValueType::F32,
                        },
                    )],
                },
                Stmt::Return(Some(Expr::bin(
                    BinaryOp::Sub,
                    Expr::call(Builtin::Length, vec![Expr::var("k_p")]),
                    Expr::Const(-3.0),
                ))),
            ],
        });
        m.entries.push(EntryPoint {
            name: "hit".into(),
            reads: vec!["depth".into()],
            writes: vec!["out_depth".into()],
            body: vec![
                Stmt::let_("k_prev", Expr::load("depth")),
                Stmt::Loop {
                    counter: "k_i".into(),
                    count: 4,
                    body: vec![Stmt::when(
                        Expr::cmp(
                            crate::kernel::ir::CompareOp::Gt,
                            Expr::var("k_i"),
                            Expr::Const(2.0),
                        ),
                        vec![Stmt::Break],
                    )],
                },
                Stmt::store(
                    "out_depth",
                    Expr::vec(
                        ValueType::Vec4,
                        vec![
                            Expr::call(
                                Builtin::Min,
                                vec![
                                    Expr::var("k_prev").swizzle("x"),
                                    Expr::func("k_map", vec![Expr::var("k_coord")]),
                                ],
                            ),
                            Expr::Const(0.0),
                            Expr::Const(0.0),
                            Expr::Const(0.0),
                        ],
                    ),
                ),
            ],
        });
        m
    }

    #[test]
    fn emitted_module_parses_with_naga() {
        let text = emit_wgsl(&sample_module());
        assert!(text.contains("var<storage, read> k_data: array<vec4f>;"));
        assert!(text.contains("texture_storage_2d<rgba32float, write>"));
        assert!(text.contains("(-3.0)"));
        validate_wgsl(&text).expect("sample module should be valid WGSL");
    }

    #[test]
    fn labeled_blocks_record_line_spans() {
        let emitted = emit_module(&sample_module());
        let span = emitted.span_of("component circle").expect("span");
        let lines: Vec<&str> = emitted.text.lines().collect();
        assert_eq!(lines[span.start - 1].trim(), "{");
        assert_eq!(lines[span.end - 2].trim(), "}");
        assert!(lines[span.start - 2].contains("// component circle"));
    }

    #[test]
    fn property_reads_are_swizzled_to_their_type() {
        let e = Expr::Property {
            slot: 7,
            ty: ValueType::Vec3,
        };
        assert_eq!(expr(&e), "k_data[7].xyz");
        let e = Expr::Property {
            slot: 2,
            ty: ValueType::Vec4,
        };
        assert_eq!(expr(&e), "k_data[2]");
    }
}
