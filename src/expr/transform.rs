//! `ExpressionTransform`: inlines `var x = ...; x*2` chains into a single closed expression.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use super::for_each_identifier;

/// Module-level memoisation cache keyed by the raw (pre-transform) input string: the result is
/// memoised by input string since the same expression source recurs across frames.
static CACHE: Lazy<Mutex<HashMap<String, String>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Transforms a `;`-separated statement list into a single closed expression.
///
/// Statements of the form `var <ident> = <expr>` populate a definition map; the final
/// non-`var` statement is the return expression, with every reachable `var`-bound identifier
/// recursively inlined and wrapped in parentheses.
pub fn transform(input: &str) -> String {
    if let Some(cached) = CACHE.lock().unwrap().get(input) {
        return cached.clone();
    }

    let result = transform_uncached(input);
    CACHE
        .lock()
        .unwrap()
        .insert(input.to_string(), result.clone());
    result
}

fn transform_uncached(input: &str) -> String {
    let mut def_map: HashMap<String, String> = HashMap::new();
    let mut final_expr = String::new();

    for raw_stmt in input.split(';') {
        let stmt = raw_stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        if let Some(rest) = stmt.strip_prefix("var ") {
            if let Some((ident, expr)) = rest.split_once('=') {
                def_map.insert(ident.trim().to_string(), expr.trim().to_string());
                continue;
            }
        }
        // Not a `var` statement: becomes (and overwrites) the candidate return expression.
        final_expr = stmt.to_string();
    }

    let mut resolved = HashMap::new();
    let inlined = inline_final(&final_expr, &def_map, &mut resolved, &mut Vec::new());
    trim_one_outer_paren_pair(&inlined)
}

/// Step 4: replaces each closure identifier found in the (outermost) final expression with its
/// fully resolved definition, wrapped in parens to preserve precedence. This is the only place
/// parentheses are introduced — the recursive resolution in [`resolve_definition`] performs
/// plain substitution, matching the worked example in scenario D.
fn inline_final(
    expr: &str,
    def_map: &HashMap<String, String>,
    resolved: &mut HashMap<String, String>,
    in_progress: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut last_end = 0;

    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    for_each_identifier(expr, |start, end| {
        let ident = &expr[start..end];
        if let Some(replacement) = resolve_definition(ident, def_map, resolved, in_progress) {
            replacements.push((start, end, format!("({replacement})")));
        }
    });

    for (start, end, replacement) in replacements {
        out.push_str(&expr[last_end..start]);
        out.push_str(&replacement);
        last_end = end;
    }
    out.push_str(&expr[last_end..]);
    out
}

/// Step 3: recursively resolves `ident`'s definition by plain (unwrapped) textual substitution
/// of any further `def_map`-bound identifiers it references, memoised in `resolved`.
/// `in_progress` detects self-reference, in which case the identifier is left as its own name
/// (degenerate case, not expected in well-formed input).
fn resolve_definition(
    ident: &str,
    def_map: &HashMap<String, String>,
    resolved: &mut HashMap<String, String>,
    in_progress: &mut Vec<String>,
) -> Option<String> {
    if !def_map.contains_key(ident) {
        return None;
    }
    if let Some(cached) = resolved.get(ident) {
        return Some(cached.clone());
    }
    if in_progress.contains(&ident.to_string()) {
        return Some(ident.to_string());
    }

    in_progress.push(ident.to_string());
    let def_expr = def_map.get(ident).unwrap().clone();

    let mut out = String::with_capacity(def_expr.len());
    let mut last_end = 0;
    let mut replacements: Vec<(usize, usize, String)> = Vec::new();
    for_each_identifier(&def_expr, |start, end| {
        let inner = &def_expr[start..end];
        if let Some(r) = resolve_definition(inner, def_map, resolved, in_progress) {
            replacements.push((start, end, r));
        }
    });
    for (start, end, replacement) in replacements {
        out.push_str(&def_expr[last_end..start]);
        out.push_str(&replacement);
        last_end = end;
    }
    out.push_str(&def_expr[last_end..]);

    in_progress.pop();
    resolved.insert(ident.to_string(), out.clone());
    Some(out)
}

/// Strips exactly one outermost parenthesis pair, but only if it actually wraps the whole
/// string (paren depth never touches zero before the final character).
fn trim_one_outer_paren_pair(s: &str) -> String {
    let trimmed = s.trim();
    let bytes = trimmed.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'(' || bytes[bytes.len() - 1] != b')' {
        return trimmed.to_string();
    }

    let mut depth = 0i32;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && i != bytes.len() - 1 {
            // Closed before the end: the outer parens don't wrap the whole string.
            return trimmed.to_string();
        }
    }

    trimmed[1..trimmed.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_d_expression_inline() {
        let out = transform("var a = b*2; var c = a+1; c*10");
        assert_eq!(out, "(b*2+1)*10");
    }

    #[test]
    fn no_var_statements_passes_through() {
        assert_eq!(transform("a+b*c"), "a+b*c");
    }

    #[test]
    fn idempotent_on_already_closed_expression() {
        let once = transform("var a = b*2; a+1");
        let twice = transform(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn self_referential_definition_is_left_as_name() {
        // Degenerate input; must not infinite-loop.
        let out = transform("var a = a+1; a");
        assert_eq!(out, "a+1");
    }

    #[test]
    fn outer_parens_trimmed_only_when_wrapping_whole_string() {
        assert_eq!(transform("(a+b)"), "a+b");
        assert_eq!(transform("(a+b)*(c+d)"), "(a+b)*(c+d)");
    }
}
