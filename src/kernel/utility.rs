//! Fixed kernels that do not come from the component graph.

use super::ir::{Access, Builtin, CompareOp, EntryPoint, Expr, KernelModule, Stmt};
use super::types::{TextureFormat, ValueType};

pub const MAIN_ENTRY: &str = "main";

fn data(slot: usize, ty: ValueType) -> Expr {
    Expr::Property { slot, ty }
}

fn v4(parts: Vec<Expr>) -> Expr {
    Expr::vec(ValueType::Vec4, parts)
}

/// Fills the bound `out` texture with record 0 of the property buffer.
pub fn clear_module(format: TextureFormat) -> KernelModule {
    let mut m = KernelModule::new(format!("clear_{}", format.wgsl()));
    m.bind("out", format, Access::Write);
    m.entries.push(EntryPoint {
        name: MAIN_ENTRY.into(),
        reads: vec![],
        writes: vec!["out".into()],
        body: vec![Stmt::store("out", data(0, ValueType::Vec4))],
    });
    m
}

/// Turns primary hits into reflected rays. Misses keep their origin and get
/// `w = 0` in the direction so later passes skip them.
pub fn reflect_rays_module(far: f32) -> KernelModule {
    let mut m = KernelModule::new("reflect_rays");
    for name in ["depth", "normal", "ray_origin", "ray_direction"] {
        m.bind(name, TextureFormat::Rgba32Float, Access::Read);
    }
    m.bind("out_ray_origin", TextureFormat::Rgba32Float, Access::Write);
    m.bind("out_ray_direction", TextureFormat::Rgba32Float, Access::Write);

    let rd = Expr::var("k_rd");
    let miss = Expr::or(
        Expr::cmp(
            CompareOp::Ge,
            Expr::var("k_depth").swizzle("x"),
            Expr::Const(far * 0.5),
        ),
        Expr::cmp(CompareOp::Lt, rd.clone().swizzle("w"), Expr::Const(0.5)),
    );
    let body = vec![
        Stmt::let_("k_depth", Expr::load("depth")),
        Stmt::let_("k_ro", Expr::load("ray_origin")),
        Stmt::let_("k_rd", Expr::load("ray_direction")),
        Stmt::when(
            miss,
            vec![
                Stmt::store("out_ray_origin", Expr::var("k_ro")),
                Stmt::store(
                    "out_ray_direction",
                    v4(vec![rd.clone().swizzle("xyz"), Expr::Const(0.0)]),
                ),
                Stmt::Return(None),
            ],
        ),
        Stmt::let_("k_n", Expr::load("normal").swizzle("xyz")),
        Stmt::let_(
            "k_p",
            Expr::add(
                Expr::var("k_ro").swizzle("xyz"),
                Expr::mul(rd.clone().swizzle("xyz"), Expr::var("k_depth").swizzle("x")),
            ),
        ),
        Stmt::store(
            "out_ray_origin",
            v4(vec![
                Expr::add(Expr::var("k_p"), Expr::mul(Expr::var("k_n"), Expr::Const(0.01))),
                Expr::Const(1.0),
            ]),
        ),
        Stmt::store(
            "out_ray_direction",
            v4(vec![
                Expr::call(Builtin::Reflect, vec![rd.swizzle("xyz"), Expr::var("k_n")]),
                Expr::Const(1.0),
            ]),
        ),
    ];
    m.entries.push(EntryPoint {
        name: MAIN_ENTRY.into(),
        reads: vec![
            "depth".into(),
            "normal".into(),
            "ray_origin".into(),
            "ray_direction".into(),
        ],
        writes: vec!["out_ray_origin".into(), "out_ray_direction".into()],
        body,
    });
    m
}

/// Mixes the reflection image over the result where a reflected ray exists.
/// Record 0.x of the property buffer is the reflectivity.
pub fn reflection_composite_module() -> KernelModule {
    let mut m = KernelModule::new("reflection_composite");
    m.bind("result", TextureFormat::Rgba16Float, Access::Read);
    m.bind("reflection", TextureFormat::Rgba16Float, Access::Read);
    m.bind("ray_direction", TextureFormat::Rgba32Float, Access::Read);
    m.bind("out_composite", TextureFormat::Rgba16Float, Access::Write);

    let body = vec![
        Stmt::let_("k_base", Expr::load("result")),
        Stmt::let_("k_refl", Expr::load("reflection")),
        Stmt::let_(
            "k_amount",
            Expr::mul(
                data(0, ValueType::F32),
                Expr::call(
                    Builtin::Step,
                    vec![
                        Expr::Const(0.5),
                        Expr::load("ray_direction").swizzle("w"),
                    ],
                ),
            ),
        ),
        Stmt::store(
            "out_composite",
            v4(vec![
                Expr::call(
                    Builtin::Mix,
                    vec![
                        Expr::var("k_base").swizzle("xyz"),
                        Expr::var("k_refl").swizzle("xyz"),
                        Expr::var("k_amount"),
                    ],
                ),
                Expr::var("k_base").swizzle("w"),
            ]),
        ),
    ];
    m.entries.push(EntryPoint {
        name: MAIN_ENTRY.into(),
        reads: vec![
            "result".into(),
            "reflection".into(),
            "ray_direction".into(),
        ],
        writes: vec!["out_composite".into()],
        body,
    });
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::validation::validate_module;

    #[test]
    fn utility_kernels_verify_and_validate() {
        let modules = [
            clear_module(TextureFormat::Rgba8Unorm),
            clear_module(TextureFormat::Rgba16Float),
            clear_module(TextureFormat::Rgba32Float),
            reflect_rays_module(10000.0),
            reflection_composite_module(),
        ];
        for m in modules {
            assert_eq!(m.verify(), Ok(()), "{}", m.label);
            if let Err(e) = validate_module(&m) {
                panic!("{e:#}");
            }
        }
    }
}
