/// Normalizes the typed learner dialect into plain rhai before the
/// structural compile. Learner sources may carry type annotations,
/// `const`/`var` bindings, `async`/`await` noise around the blocking-style
/// bridge calls, and JS-flavored operators; none of those survive here.
/// The result is only accepted once `Engine::compile` turns it into an AST,
/// so a rewrite that breaks structure fails loudly at the compile step
/// instead of at run time.
pub fn prepare_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for raw in source.lines() {
        let indent: String = raw.chars().take_while(|c| c.is_ascii_whitespace()).collect();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            out.push('\n');
            continue;
        }
        if trimmed.starts_with("//") {
            out.push_str(&indent);
            out.push_str(trimmed);
            out.push('\n');
            continue;
        }

        // `async` goes first so an `async function` header is still
        // recognized as a header below.
        let mut line = replace_word_token(trimmed, "async", "");
        line = line.trim_start().to_string();
        if let Some(header) = convert_function_header(&line) {
            line = header;
        }
        line = strip_binding_annotation(&line);
        line = replace_word_token(&line, "const", "let");
        line = replace_word_token(&line, "var", "let");
        line = replace_word_token(&line, "await", "");
        line = replace_word_token(&line, "undefined", "()");
        line = replace_word_token(&line, "null", "()");
        line = replace_operator(&line, "===", "==");
        line = replace_operator(&line, "!==", "!=");

        out.push_str(&indent);
        out.push_str(line.trim_start());
        out.push('\n');
    }
    out
}

/// `function name(a: Robot, b: number): void {` -> `fn name(a, b) {`
fn convert_function_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("function ")?.trim();
    let open = rest.find('(')?;
    let close = find_matching_paren(rest, open)?;
    let name = rest[..open].trim();
    let params = rest[(open + 1)..close]
        .split(',')
        .map(|param| {
            let param = param.trim();
            match split_outside_strings(param, ':') {
                Some(idx) => param[..idx].trim().to_string(),
                None => param.to_string(),
            }
        })
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    let tail = rest[(close + 1)..].trim();
    // Drop a `: ReturnType` between the params and the body brace.
    let tail = match tail.strip_prefix(':') {
        Some(after) => after.find('{').map(|idx| &after[idx..]).unwrap_or(""),
        None => tail,
    };
    Some(format!("fn {name}({params}) {tail}").trim_end().to_string())
}

/// `let pos: Position = ...` -> `let pos = ...`; leaves map literals alone
/// because only the segment before the first top-level `=` is touched.
fn strip_binding_annotation(line: &str) -> String {
    let is_binding = ["let ", "const ", "var "]
        .iter()
        .any(|kw| line.starts_with(kw));
    if !is_binding {
        return line.to_string();
    }
    let Some(eq) = split_outside_strings(line, '=') else {
        return line.to_string();
    };
    let (lhs, rhs) = line.split_at(eq);
    match split_outside_strings(lhs, ':') {
        Some(colon) => format!("{} {}", lhs[..colon].trim_end(), rhs),
        None => line.to_string(),
    }
}

fn find_matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices().skip(open) {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Index of the first `needle` outside string literals, or None.
fn split_outside_strings(text: &str, needle: char) -> Option<usize> {
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' | '`' => in_string = Some(ch),
            c if c == needle => return Some(idx),
            _ => {}
        }
    }
    None
}

/// Word-boundary-aware token replacement that never rewrites inside string
/// literals.
fn replace_word_token(input: &str, token: &str, replacement: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let token_chars: Vec<char> = token.chars().collect();
    let mut out = String::with_capacity(input.len() + 8);
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if let Some(quote) = in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }
        if ch == '"' || ch == '\'' || ch == '`' {
            in_string = Some(ch);
            out.push(ch);
            i += 1;
            continue;
        }
        if i + token_chars.len() <= chars.len()
            && chars[i..(i + token_chars.len())] == token_chars[..]
        {
            let prev_ok = i == 0 || !is_word_char(chars[i - 1]);
            let next_ok =
                i + token_chars.len() == chars.len() || !is_word_char(chars[i + token_chars.len()]);
            if prev_ok && next_ok {
                out.push_str(replacement);
                i += token_chars.len();
                continue;
            }
        }
        out.push(ch);
        i += 1;
    }
    out
}

fn replace_operator(input: &str, from: &str, to: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    // Operators never appear inside identifiers, so a plain scan suffices,
    // but string literals still need protecting.
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    while let Some(ch) = rest.chars().next() {
        if let Some(quote) = in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == quote {
                in_string = None;
            }
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        if ch == '"' || ch == '\'' || ch == '`' {
            in_string = Some(ch);
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
            continue;
        }
        if rest.starts_with(from) {
            out.push_str(to);
            rest = &rest[from.len()..];
            continue;
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
