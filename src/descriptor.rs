use anyhow::{bail, Context, Result};

/// Parsed method descriptor with dotted Java type renderings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodSig {
    pub(crate) params: Vec<String>,
    pub(crate) return_type: String,
}

impl MethodSig {
    pub(crate) fn param_count(&self) -> usize {
        self.params.len()
    }

    pub(crate) fn returns_value(&self) -> bool {
        self.return_type != "void"
    }
}

/// Parse a JVM method descriptor such as `(Ljava/lang/String;I)V`.
pub(crate) fn parse_method_descriptor(descriptor: &str) -> Result<MethodSig> {
    let rest = descriptor
        .strip_prefix('(')
        .with_context(|| format!("method descriptor must start with '(': {descriptor}"))?;
    let close = rest
        .find(')')
        .with_context(|| format!("method descriptor missing ')': {descriptor}"))?;
    let (param_part, return_part) = rest.split_at(close);
    let return_part = &return_part[1..];

    let mut params = Vec::new();
    let mut index = 0usize;
    while index < param_part.len() {
        let end = skip_type(param_part, index)
            .with_context(|| format!("invalid parameter type in descriptor {descriptor}"))?;
        params.push(render_type(&param_part[index..end])?);
        index = end;
    }

    let return_type = render_type(return_part)
        .with_context(|| format!("invalid return type in descriptor {descriptor}"))?;
    Ok(MethodSig {
        params,
        return_type,
    })
}

/// Canonical `"<return-type> <name>(<param>,<param>)"` rendering, matching
/// the form used in findings and report rows.
pub(crate) fn sub_signature(name: &str, descriptor: &str) -> Result<String> {
    let sig = parse_method_descriptor(descriptor)?;
    Ok(format!(
        "{} {}({})",
        sig.return_type,
        name,
        sig.params.join(",")
    ))
}

/// Offset one past the end of the type descriptor starting at `start`.
fn skip_type(descriptor: &str, start: usize) -> Result<usize> {
    let bytes = descriptor.as_bytes();
    let mut index = start;
    while index < bytes.len() && bytes[index] == b'[' {
        index += 1;
    }
    if index >= bytes.len() {
        bail!("truncated type descriptor");
    }
    match bytes[index] {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b'V' => Ok(index + 1),
        b'L' => {
            let end = descriptor[index..]
                .find(';')
                .context("unterminated object type descriptor")?;
            Ok(index + end + 1)
        }
        other => bail!("unexpected type descriptor tag '{}'", other as char),
    }
}

/// Dotted Java rendering of a single type descriptor, with `[]` suffixes
/// for arrays, e.g. `[Ljava/lang/String;` becomes `java.lang.String[]`.
fn render_type(descriptor: &str) -> Result<String> {
    let mut dims = 0usize;
    let mut rest = descriptor;
    while let Some(stripped) = rest.strip_prefix('[') {
        dims += 1;
        rest = stripped;
    }
    let base = match rest.as_bytes().first() {
        Some(b'B') => "byte".to_string(),
        Some(b'C') => "char".to_string(),
        Some(b'D') => "double".to_string(),
        Some(b'F') => "float".to_string(),
        Some(b'I') => "int".to_string(),
        Some(b'J') => "long".to_string(),
        Some(b'S') => "short".to_string(),
        Some(b'Z') => "boolean".to_string(),
        Some(b'V') => "void".to_string(),
        Some(b'L') => rest
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .context("unterminated object type descriptor")?
            .replace('/', "."),
        _ => bail!("empty type descriptor"),
    };
    if rest.len() > 1 && !rest.starts_with('L') {
        bail!("trailing characters in type descriptor: {descriptor}");
    }
    Ok(format!("{}{}", base, "[]".repeat(dims)))
}
