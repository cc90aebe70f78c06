//! Identifier and literal helpers for WGSL emission.

/// Format a float for WGSL. The result always parses as a float literal
/// (`1.0`, `0.25`, `1e-7`), never as an abstract integer.
pub fn fmt_f32(v: f32) -> String {
    if !v.is_finite() {
        return "0.0".to_string();
    }
    let s = format!("{v:?}");
    if s.contains('.') || s.contains('e') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Sanitize a string to be a valid WGSL identifier.
pub fn sanitize_wgsl_ident(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Kernel identifier for a graph variable. The `v_` prefix keeps graph names
/// clear of WGSL keywords, builtins and the internal `k_` namespace.
pub fn user_ident(name: &str) -> String {
    format!("v_{}", sanitize_wgsl_ident(name))
}

/// WGSL identifier of a texture binding.
pub fn texture_ident(binding: &str) -> String {
    format!("t_{}", sanitize_wgsl_ident(binding))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_always_carry_a_fraction_or_exponent() {
        assert_eq!(fmt_f32(1.0), "1.0");
        assert_eq!(fmt_f32(-2.0), "-2.0");
        assert_eq!(fmt_f32(0.25), "0.25");
        assert_eq!(fmt_f32(10000.0), "10000.0");
        assert_eq!(fmt_f32(f32::NAN), "0.0");
        let tiny = fmt_f32(1e-7);
        assert!(tiny.contains('e') || tiny.contains('.'));
    }

    #[test]
    fn identifiers_are_sanitized_and_namespaced() {
        assert_eq!(sanitize_wgsl_ident("my node-1"), "my_node_1");
        assert_eq!(sanitize_wgsl_ident(""), "_");
        assert_eq!(user_ident("distance"), "v_distance");
        assert_eq!(texture_ident("out_depth"), "t_out_depth");
    }
}
