//! Brace-safe template substitution.
//!
//! Templates contain literal JSON alongside `{placeholder}` markers, so a
//! naive search-and-replace pass over values is unsafe: a substituted value
//! could itself contain `{other_placeholder}` and be rewritten by a later
//! pass.  Substitution therefore happens in two phases: every declared
//! placeholder is first tokenized to a sentinel that cannot occur in
//! template or value text, then each sentinel is replaced exactly once.
//! All braces not belonging to a declared placeholder pass through
//! untouched.

const SENTINEL: char = '\u{1}';

pub fn safe_format(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (index, (name, _)) in values.iter().enumerate() {
        out = out.replace(&format!("{{{name}}}"), &format!("{SENTINEL}{index}{SENTINEL}"));
    }
    for (index, (_, value)) in values.iter().enumerate() {
        out = out.replace(&format!("{SENTINEL}{index}{SENTINEL}"), value);
    }
    out
}
