//! WGSL validation using the naga library.

use anyhow::{Context, Result, anyhow};

use super::ir::KernelModule;
use super::wgsl::emit_wgsl;

/// Parse and validate WGSL source.
///
/// Returns the naga module on success, or an error carrying the message and a
/// line-numbered dump of the source.
pub fn validate_wgsl(source: &str) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("WGSL parse failed:\n{}", format_failure(source, &e.emit_to_string(source))))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| anyhow!("WGSL validation failed:\n{}", format_failure(source, &format!("{e:?}"))))?;
    Ok(module)
}

/// Validate WGSL and name what generated it.
pub fn validate_wgsl_with_context(source: &str, context: &str) -> Result<naga::Module> {
    validate_wgsl(source).with_context(|| format!("{context} generated invalid WGSL"))
}

/// Emit a kernel module and validate the result.
pub fn validate_module(module: &KernelModule) -> Result<String> {
    let text = emit_wgsl(module);
    validate_wgsl_with_context(&text, &format!("kernel '{}'", module.label))?;
    Ok(text)
}

fn format_failure(source: &str, message: &str) -> String {
    let mut output = String::new();
    output.push_str(&format!("  {message}\n"));
    output.push_str("\nGenerated WGSL:\n");
    output.push_str("---\n");
    for (line_num, line) in source.lines().enumerate() {
        output.push_str(&format!("{:4} | {}\n", line_num + 1, line));
    }
    output.push_str("---\n");
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_minimal_compute_kernel() {
        let source = r#"
@group(0) @binding(0) var<storage, read> k_data: array<vec4f>;
@group(0) @binding(1) var t_out: texture_storage_2d<rgba16float, write>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3u) {
    textureStore(t_out, vec2i(id.xy), k_data[0]);
}
"#;
        assert!(validate_wgsl(source).is_ok());
    }

    #[test]
    fn rejects_type_errors() {
        let source = r#"
fn f() -> vec4f {
    let x: vec4f = 1.0;
    return x;
}
"#;
        assert!(validate_wgsl(source).is_err());
    }

    #[test]
    fn context_and_source_dump_appear_in_the_error() {
        let result = validate_wgsl_with_context("fn broken( {", "shape_0");
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("shape_0"));
        assert!(msg.contains("   1 | fn broken( {"));
    }
}
