//! Minimal editing of the curly-brace configuration format.
//!
//! Only what seeding a new image needs: setting one leaf value, creating
//! the nodes leading to it. Comments and formatting of untouched lines
//! are preserved.

const INDENT: &str = "    ";

/// The node path of the administrator's password hash.
pub(crate) const ENCRYPTED_PASSWORD_PATH: &[&str] =
    &["system", "login", "user vyos", "authentication"];
pub(crate) const ENCRYPTED_PASSWORD_LEAF: &str = "encrypted-password";

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Set `leaf` below the node `path` to `value`, replacing an existing value.
pub(crate) fn set_leaf(config: &str, path: &[&str], leaf: &str, value: &str) -> String {
    let mut lines: Vec<String> = config.lines().map(ToOwned::to_owned).collect();
    let mut stack: Vec<String> = Vec::new();
    // Line index of the closing brace of the first node matching each prefix of `path`
    let mut closers: Vec<Option<usize>> = vec![None; path.len() + 1];
    let new_leaf = format!("{leaf} {}", quote(value));

    for (i, line) in lines.iter().enumerate() {
        let t = line.trim();
        if t.starts_with("//") || t.starts_with("/*") {
            continue;
        }
        if t == "}" {
            let depth = stack.len();
            if depth <= path.len()
                && closers[depth].is_none()
                && stack.iter().zip(path).all(|(a, b)| a == b)
            {
                closers[depth] = Some(i);
            }
            stack.pop();
        } else if let Some(node) = t.strip_suffix('{') {
            stack.push(node.trim().to_owned());
        } else if stack.len() == path.len()
            && stack.iter().zip(path).all(|(a, b)| a == b)
            && (t == leaf || t.starts_with(&format!("{leaf} ")))
        {
            let indent = &line[..line.len() - line.trim_start().len()];
            let replaced = format!("{indent}{new_leaf}");
            lines[i] = replaced;
            return join(lines, config);
        }
    }

    // Insert the missing nodes below the deepest existing one
    let (depth, at) = (1..=path.len())
        .rev()
        .find_map(|d| closers[d].map(|i| (d, i)))
        .unwrap_or((0, lines.len()));
    let mut insert = Vec::new();
    for (d, node) in path.iter().enumerate().skip(depth) {
        insert.push(format!("{}{node} {{", INDENT.repeat(d)));
    }
    insert.push(format!("{}{new_leaf}", INDENT.repeat(path.len())));
    for d in (depth..path.len()).rev() {
        insert.push(format!("{}}}", INDENT.repeat(d)));
    }
    lines.splice(at..at, insert);
    join(lines, config)
}

fn join(lines: Vec<String>, original: &str) -> String {
    let mut s = lines.join("\n");
    if original.ends_with('\n') || original.is_empty() {
        s.push('\n');
    }
    s
}

/// Set the administrator's password hash.
pub(crate) fn set_encrypted_password(config: &str, hash: &str) -> String {
    set_leaf(config, ENCRYPTED_PASSWORD_PATH, ENCRYPTED_PASSWORD_LEAF, hash)
}
