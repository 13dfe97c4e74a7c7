// ─────────────────────────────────────────────────────────────────────────────
//  hotaru-build :: prototypes  —  function prototype synthesis
//
//  The sketch dialect lets functions be called before they are defined; we
//  make that legal C++ by hoisting a block of forward declarations ahead of
//  the user's code.  Definitions are harvested from the *preprocessed*
//  translation unit (restricted to the regions that #line-map back into the
//  sketch), while the insertion point is found in the *original* source so
//  the block lands after the leading includes and using-declarations.
//
//  This is a tolerant scanner, not a parser: anything it cannot confidently
//  classify as a top-level function definition is skipped silently.
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::HashSet;

#[derive(Debug)]
pub struct PrototypeReport {
    /// Ready-to-insert text: a `#line 1` marker followed by one prototype
    /// per line.  Empty when no prototypes were found.
    pub block: String,
    /// 1-based line in the original main unit where the block belongs.
    pub insertion_line: usize,
    /// The synthesized prototypes, in discovery order.
    pub prototypes: Vec<String>,
}

/// Analyze a preprocessed translation unit against the original main unit.
///
/// `sketch_paths` are the exact path strings used in the merged file's
/// `#line` directives; only those regions are harvested.
pub fn analyze(
    preprocessed: &str,
    original_main: &str,
    main_path: &str,
    sketch_paths: &[String],
) -> PrototypeReport {
    let insertion_line = insertion_line(original_main);
    let prototypes = extract_prototypes(preprocessed, sketch_paths);

    let block = if prototypes.is_empty() {
        String::new()
    } else {
        let mut out = format!("#line 1 \"{}\"\n", main_path);
        for p in &prototypes {
            out.push_str(p);
            out.push('\n');
        }
        out
    };

    PrototypeReport { block, insertion_line, prototypes }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Insertion point
// ─────────────────────────────────────────────────────────────────────────────

/// First line of the original sketch that is not blank, a comment, a
/// preprocessor directive, or a using-declaration.
fn insertion_line(original: &str) -> usize {
    let mut in_block_comment = false;
    let mut lines_seen = 0;

    for (idx, raw) in original.lines().enumerate() {
        lines_seen = idx + 1;
        let mut effective = String::new();
        let mut chars = raw.chars().peekable();
        let mut in_str = false;
        let mut in_char = false;

        while let Some(c) = chars.next() {
            if in_block_comment {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
                continue;
            }
            if in_str {
                match c {
                    '\\' => {
                        chars.next();
                    }
                    '"' => in_str = false,
                    _ => {}
                }
                effective.push(' ');
                continue;
            }
            if in_char {
                match c {
                    '\\' => {
                        chars.next();
                    }
                    '\'' => in_char = false,
                    _ => {}
                }
                effective.push(' ');
                continue;
            }
            match c {
                '/' if chars.peek() == Some(&'/') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    in_block_comment = true;
                }
                '"' => {
                    in_str = true;
                    effective.push(' ');
                }
                '\'' => {
                    in_char = true;
                    effective.push(' ');
                }
                _ => effective.push(c),
            }
        }

        let t = effective.trim();
        if t.is_empty() || t.starts_with('#') {
            continue;
        }
        if t == "using" || t.starts_with("using ") || t.starts_with("using\t") {
            continue;
        }
        return idx + 1;
    }
    lines_seen + 1
}

// ─────────────────────────────────────────────────────────────────────────────
//  Definition harvesting
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Scope {
    /// `extern "C"`/`extern "C++"` block: contents stay top-level.
    Linkage,
    Opaque,
}

fn extract_prototypes(preprocessed: &str, sketch_paths: &[String]) -> Vec<String> {
    let mut scopes: Vec<Scope> = Vec::new();
    let mut candidate = String::new();
    let mut in_sketch = false;

    let mut protos: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut declared: HashSet<String> = HashSet::new();

    for raw in preprocessed.lines() {
        let trimmed = raw.trim_start();
        if trimmed.starts_with('#') {
            if let Some(file) = line_directive_file(trimmed) {
                let entering = sketch_paths.iter().any(|p| p == file);
                if entering != in_sketch {
                    candidate.clear();
                }
                in_sketch = entering;
            }
            continue;
        }
        if !in_sketch {
            continue;
        }

        let mut chars = raw.chars().peekable();
        let mut in_str = false;
        let mut in_char = false;
        while let Some(c) = chars.next() {
            if in_str {
                candidate.push(c);
                match c {
                    '\\' => {
                        if let Some(n) = chars.next() {
                            candidate.push(n);
                        }
                    }
                    '"' => in_str = false,
                    _ => {}
                }
                continue;
            }
            if in_char {
                candidate.push(c);
                match c {
                    '\\' => {
                        if let Some(n) = chars.next() {
                            candidate.push(n);
                        }
                    }
                    '\'' => in_char = false,
                    _ => {}
                }
                continue;
            }
            let depth = scopes.iter().filter(|s| **s == Scope::Opaque).count();
            match c {
                '"' => {
                    in_str = true;
                    candidate.push(c);
                }
                '\'' => {
                    in_char = true;
                    candidate.push(c);
                }
                '{' => {
                    if depth == 0 {
                        let header = collapse_ws(&candidate);
                        if is_linkage_spec(&header) {
                            scopes.push(Scope::Linkage);
                        } else {
                            let in_linkage = scopes.contains(&Scope::Linkage);
                            if let Some(proto) = synthesize(&header, in_linkage) {
                                let plain = proto.trim_start_matches("extern \"C\" ").to_owned();
                                if !declared.contains(&proto)
                                    && !declared.contains(&plain)
                                    && seen.insert(proto.clone())
                                {
                                    protos.push(proto);
                                }
                            }
                            scopes.push(Scope::Opaque);
                        }
                    } else {
                        scopes.push(Scope::Opaque);
                    }
                    candidate.clear();
                }
                '}' => {
                    scopes.pop();
                    candidate.clear();
                }
                ';' => {
                    if depth == 0 {
                        let decl = collapse_ws(&candidate);
                        if !decl.is_empty() {
                            declared.insert(format!("{};", decl));
                        }
                    }
                    candidate.clear();
                }
                _ => candidate.push(c),
            }
        }
        candidate.push(' ');
    }
    protos
}

/// Recognize `# <n> "<file>" ...` and `#line <n> "<file>"`.
pub(crate) fn line_directive_file(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('#')?.trim_start();
    let rest = rest.strip_prefix("line").unwrap_or(rest).trim_start();
    if !rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let quote = rest.find('"')?;
    let tail = &rest[quote + 1..];
    let end = tail.find('"')?;
    Some(&tail[..end])
}

fn is_linkage_spec(header: &str) -> bool {
    header == "extern \"C\"" || header == "extern \"C++\""
}

fn collapse_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_ws = true;
    for c in s.chars() {
        if c.is_whitespace() {
            if !last_ws {
                out.push(' ');
            }
            last_ws = true;
        } else {
            out.push(c);
            last_ws = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

const NOT_FUNCTION_LEAD: &[&str] = &[
    "class", "struct", "union", "enum", "namespace", "typedef", "static_assert",
];

const NOT_FUNCTION_NAME: &[&str] = &[
    "if", "else", "for", "while", "do", "switch", "return", "sizeof", "catch",
];

/// Turn a definition header into a one-line prototype, or refuse.
fn synthesize(header: &str, in_linkage: bool) -> Option<String> {
    let mut h = header.trim().to_owned();
    let mut wrap_c = in_linkage;
    if let Some(rest) = h.strip_prefix("extern \"C\" ") {
        wrap_c = true;
        h = rest.to_owned();
    } else if let Some(rest) = h.strip_prefix("extern \"C++\" ") {
        h = rest.to_owned();
    }
    if h.is_empty() || h.contains('=') || h.contains(';') {
        return None;
    }

    // Template head: keep it verbatim, but only when the parameter list is
    // balanced; otherwise skip silently.
    let decl = if let Some(rest) = h.strip_prefix("template") {
        let rest = rest.trim_start();
        if !rest.starts_with('<') {
            return None;
        }
        let mut depth = 0usize;
        let mut end = None;
        for (i, c) in rest.char_indices() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        rest[end? + 1..].trim_start()
    } else {
        h.as_str()
    };

    let lead = decl.split_whitespace().next()?;
    if NOT_FUNCTION_LEAD.contains(&lead) {
        return None;
    }

    // First parenthesis outside template arguments opens the parameter list.
    let mut angle = 0usize;
    let mut paren_at = None;
    for (i, c) in decl.char_indices() {
        match c {
            '<' => angle += 1,
            '>' => angle = angle.saturating_sub(1),
            '(' if angle == 0 => {
                paren_at = Some(i);
                break;
            }
            _ => {}
        }
    }
    let paren_at = paren_at?;

    // Identifier immediately before the parameter list.
    let before = decl[..paren_at].trim_end();
    let name_start = before
        .rfind(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|i| i + 1)
        .unwrap_or(0);
    let name = &before[name_start..];
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    if NOT_FUNCTION_NAME.contains(&name) {
        return None;
    }
    let prefix = before[..name_start].trim_end();
    if prefix.is_empty() {
        // No return type: constructor-like or K&R noise, not a sketch function.
        return None;
    }
    if prefix.ends_with(':') || prefix.ends_with('~') {
        // Qualified or destructor definition.
        return None;
    }

    let proto = format!("{};", h);
    Some(if wrap_c {
        format!("extern \"C\" {}", proto)
    } else {
        proto
    })
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const INO: &str = "/sketch/Blink/Blink.ino";

    fn run(original: &str) -> PrototypeReport {
        let pre = format!("# 1 \"{}\"\n{}\n", INO, original);
        analyze(&pre, original, INO, &[INO.to_owned()])
    }

    #[test]
    fn empty_sketch_gets_setup_and_loop() {
        let report = run("void setup(){} void loop(){}");
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
        assert!(report.block.contains("void setup();\nvoid loop();\n"));
        assert!(report.block.starts_with(&format!("#line 1 \"{}\"", INO)));
        assert_eq!(report.insertion_line, 1);
    }

    #[test]
    fn insertion_point_skips_comments_directives_and_using() {
        let src = "\
// Blink example
/* a
   longer banner */
#include <Arduino.h>
using namespace std;

int counter = 0;
void setup() {}
";
        let report = run(src);
        assert_eq!(report.insertion_line, 7);
    }

    #[test]
    fn static_assert_is_not_a_prototype() {
        let report = run("static_assert(sizeof(int)==4,\"\");\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn multiline_template_collapses_to_one_line() {
        let report = run("template<typename T>\nT add(T a,\n T b){return a+b;}\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(report.prototypes[0], "template<typename T> T add(T a, T b);");
    }

    #[test]
    fn malformed_template_is_skipped_silently() {
        let report = run("template<typename T\nT broken(T a){return a;}\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn extern_c_block_wraps_prototypes() {
        let report = run("extern \"C\" {\nvoid isr_tick() {}\n}\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(
            report.prototypes,
            vec!["extern \"C\" void isr_tick();", "void setup();", "void loop();"]
        );
    }

    #[test]
    fn single_extern_c_definition_keeps_wrapper() {
        let report = run("extern \"C\" void isr_tick() {}\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(report.prototypes[0], "extern \"C\" void isr_tick();");
    }

    #[test]
    fn forward_declared_functions_are_skipped() {
        let report = run("int helper();\nvoid setup(){ helper(); }\nvoid loop(){}\nint helper(){ return 1; }");
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn initializers_and_control_flow_are_not_functions() {
        let src = "int table[] = {1,2,3};\nvoid setup(){ if (table[0]) {} }\nvoid loop(){}";
        let report = run(src);
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn braces_inside_strings_are_ignored(){
        let report = run("void setup(){ const char* s = \"{\"; (void)s; }\nvoid loop(){}");
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn multiline_return_type_is_collapsed() {
        let report = run("unsigned\nlong\nread_clock() { return 0; }\nvoid setup(){}\nvoid loop(){}");
        assert_eq!(report.prototypes[0], "unsigned long read_clock();");
    }

    #[test]
    fn only_sketch_regions_are_harvested() {
        let pre = format!(
            "# 1 \"/core/wiring.c\"\nvoid core_helper(){{}}\n# 1 \"{}\"\nvoid setup(){{}} void loop(){{}}\n",
            INO
        );
        let report = analyze(&pre, "void setup(){} void loop(){}", INO, &[INO.to_owned()]);
        assert_eq!(report.prototypes, vec!["void setup();", "void loop();"]);
    }

    #[test]
    fn empty_sketch_block_is_empty() {
        let report = run("// nothing here\n#include <Arduino.h>\n");
        assert!(report.block.is_empty());
        assert!(report.prototypes.is_empty());
        assert_eq!(report.insertion_line, 3);
    }
}
