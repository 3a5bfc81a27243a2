use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::finding::{Analysis, Verdict};

const STYLE_CSS: &str = include_str!("../assets/report/style.css");
const REPORT_JS: &str = include_str!("../assets/report/report.js");

/// Write the plain-text report: one block per class with one line per
/// finding and a closing total.
pub(crate) fn write_text<W: Write>(
    analyses_by_class: &BTreeMap<String, Vec<Analysis>>,
    out: &mut W,
) -> Result<()> {
    for (class_name, analyses) in analyses_by_class {
        writeln!(out)?;
        writeln!(out, "Class: {class_name}")?;
        for analysis in analyses {
            let finding = &analysis.finding;
            writeln!(
                out,
                "class={}:{}  method={}  api={}  algorithm={}  provider={}  verdict={}  reason={}  rule={}",
                finding.location.class_name,
                finding.location.line,
                finding.location.method_signature,
                finding.api,
                finding.algorithm_printable(),
                finding.provider_printable(),
                analysis.verdict,
                analysis.reason.as_deref().unwrap_or(""),
                analysis.rule_id,
            )?;
        }
        writeln!(out, "Total findings: {}", analyses.len())?;
    }
    Ok(())
}

/// Row model embedded as JSON into per-class HTML pages; `report.js`
/// renders, sorts, and filters these client-side.
#[derive(Serialize)]
struct HtmlRow<'a> {
    line: i32,
    method: &'a str,
    api: &'a str,
    algorithm: &'a str,
    provider: &'a str,
    verdict: Verdict,
    reason: &'a str,
    rule: &'a str,
}

/// Write the HTML report: `index.html`, one page per class that has any
/// FAIL or UNKNOWN verdict, and the static assets under `resources/`.
pub(crate) fn write_html(
    analyses_by_class: &BTreeMap<String, Vec<Analysis>>,
    output_dir: &Path,
) -> Result<()> {
    let classes_dir = output_dir.join("classes");
    fs::create_dir_all(&classes_dir)
        .with_context(|| format!("failed to create {}", classes_dir.display()))?;
    let resources_dir = output_dir.join("resources");
    fs::create_dir_all(&resources_dir)
        .with_context(|| format!("failed to create {}", resources_dir.display()))?;
    fs::write(resources_dir.join("style.css"), STYLE_CSS).context("write style.css")?;
    fs::write(resources_dir.join("report.js"), REPORT_JS).context("write report.js")?;

    let index = render_index(analyses_by_class);
    fs::write(output_dir.join("index.html"), index).context("write index.html")?;

    for (class_name, analyses) in analyses_by_class {
        if !has_issues(analyses) {
            continue;
        }
        let page = render_class_page(class_name, analyses)?;
        let path = classes_dir.join(class_file_name(class_name));
        fs::write(&path, page).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn class_file_name(class_name: &str) -> String {
    format!("{}.html", class_name.replace('.', "_"))
}

fn has_issues(analyses: &[Analysis]) -> bool {
    analyses
        .iter()
        .any(|a| matches!(a.verdict, Verdict::Fail | Verdict::Unknown))
}

fn count_verdicts(analyses: &[Analysis]) -> (usize, usize, usize) {
    let mut pass = 0;
    let mut fail = 0;
    let mut unknown = 0;
    for analysis in analyses {
        match analysis.verdict {
            Verdict::Pass => pass += 1,
            Verdict::Fail => fail += 1,
            Verdict::Unknown => unknown += 1,
        }
    }
    (pass, fail, unknown)
}

fn render_index(analyses_by_class: &BTreeMap<String, Vec<Analysis>>) -> String {
    let total: usize = analyses_by_class.values().map(Vec::len).sum();
    let mut pass = 0;
    let mut fail = 0;
    let mut unknown = 0;
    for analyses in analyses_by_class.values() {
        let (p, f, u) = count_verdicts(analyses);
        pass += p;
        fail += f;
        unknown += u;
    }

    let mut issue_rows = String::new();
    let mut clean_rows = String::new();
    for (class_name, analyses) in analyses_by_class {
        let (p, f, u) = count_verdicts(analyses);
        let row = if has_issues(analyses) {
            format!(
                "<tr><td><a href=\"classes/{}\">{}</a></td><td>{}</td><td>{p}</td><td>{f}</td><td>{u}</td></tr>\n",
                class_file_name(class_name),
                escape(class_name),
                analyses.len(),
            )
        } else {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{p}</td><td>{f}</td><td>{u}</td></tr>\n",
                escape(class_name),
                analyses.len(),
            )
        };
        if has_issues(analyses) {
            issue_rows.push_str(&row);
        } else {
            clean_rows.push_str(&row);
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Crypto audit report</title>
<link rel="stylesheet" href="resources/style.css">
</head>
<body>
<h1>Crypto audit report</h1>
<div class="summary">
<span class="stat">Total: {total}</span>
<span class="stat pass">PASS: {pass}</span>
<span class="stat fail">FAIL: {fail}</span>
<span class="stat unknown">UNKNOWN: {unknown}</span>
</div>
<h2>Classes with issues</h2>
<table>
<thead><tr><th>Class</th><th>Findings</th><th>PASS</th><th>FAIL</th><th>UNKNOWN</th></tr></thead>
<tbody>
{issue_rows}</tbody>
</table>
<h2>Clean classes</h2>
<table>
<thead><tr><th>Class</th><th>Findings</th><th>PASS</th><th>FAIL</th><th>UNKNOWN</th></tr></thead>
<tbody>
{clean_rows}</tbody>
</table>
</body>
</html>
"#
    )
}

fn render_class_page(class_name: &str, analyses: &[Analysis]) -> Result<String> {
    // Stable page ordering: by line, then API.
    let mut sorted: Vec<&Analysis> = analyses.iter().collect();
    sorted.sort_by(|a, b| {
        a.finding
            .location
            .line
            .cmp(&b.finding.location.line)
            .then_with(|| a.finding.api.cmp(&b.finding.api))
    });

    let rows: Vec<HtmlRow<'_>> = sorted
        .iter()
        .map(|analysis| HtmlRow {
            line: analysis.finding.location.line,
            method: &analysis.finding.location.method_signature,
            api: &analysis.finding.api,
            algorithm: analysis.finding.algorithm_printable(),
            provider: analysis.finding.provider_printable(),
            verdict: analysis.verdict,
            reason: analysis.reason.as_deref().unwrap_or(""),
            rule: &analysis.rule_id,
        })
        .collect();
    // Row fields come from scanned class constants; escape `<` so a value
    // containing `</script>` cannot terminate the script element.
    let rows_json = serde_json::to_string(&rows)
        .context("serialize report rows")?
        .replace('<', "\\u003c");

    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{class_name}</title>
<link rel="stylesheet" href="../resources/style.css">
</head>
<body>
<h1>{class_name}</h1>
<p><a href="../index.html">&larr; back to summary</a></p>
<div class="filters">
Filter:
<button data-verdict="ALL" class="active">ALL</button>
<button data-verdict="PASS">PASS</button>
<button data-verdict="FAIL">FAIL</button>
<button data-verdict="UNKNOWN">UNKNOWN</button>
</div>
<table id="findings">
<thead><tr>
<th data-key="line">Line</th>
<th data-key="method">Method</th>
<th data-key="api">API</th>
<th data-key="algorithm">Algorithm</th>
<th data-key="provider">Provider</th>
<th data-key="verdict">Verdict</th>
<th data-key="reason">Reason</th>
<th data-key="rule">Rule</th>
</tr></thead>
<tbody></tbody>
</table>
<script>const ROWS = {rows_json};</script>
<script src="../resources/report.js"></script>
</body>
</html>
"#,
        class_name = escape(class_name),
    ))
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::finding::{ArgumentValue, Finding, Location};

    fn analysis(class: &str, verdict: Verdict, reason: &str, rule: &str) -> Analysis {
        Analysis {
            finding: Finding {
                api: "java.security.MessageDigest.getInstance".to_string(),
                declaring_class: "java.security.MessageDigest".to_string(),
                method_name: "getInstance".to_string(),
                sub_signature: "java.security.MessageDigest getInstance(java.lang.String)"
                    .to_string(),
                args: vec![ArgumentValue::resolved(0, "MD5")],
                location: Location {
                    class_name: class.to_string(),
                    method_signature: "void run()".to_string(),
                    source_file: "App.java".to_string(),
                    line: 7,
                },
            },
            policy_id: "fips-test".to_string(),
            rule_id: rule.to_string(),
            verdict,
            reason: Some(reason.to_string()),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "jceprobe-{tag}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn text_report_renders_expected_fields() {
        let mut by_class = BTreeMap::new();
        by_class.insert(
            "com.example.App".to_string(),
            vec![analysis("com.example.App", Verdict::Fail, "ALGO_DENIED", "R1")],
        );
        let mut out = Vec::new();

        write_text(&by_class, &mut out).expect("write text");
        let text = String::from_utf8(out).expect("utf8");

        assert!(text.contains("Class: com.example.App"));
        assert!(text.contains(
            "class=com.example.App:7  method=void run()  api=java.security.MessageDigest.getInstance  \
             algorithm=MD5  provider=None  verdict=FAIL  reason=ALGO_DENIED  rule=R1"
        ));
        assert!(text.contains("Total findings: 1"));
    }

    #[test]
    fn text_report_counts_empty_classes() {
        let mut by_class = BTreeMap::new();
        by_class.insert("com.example.Quiet".to_string(), Vec::new());
        let mut out = Vec::new();

        write_text(&by_class, &mut out).expect("write text");
        let text = String::from_utf8(out).expect("utf8");

        assert!(text.contains("Class: com.example.Quiet"));
        assert!(text.contains("Total findings: 0"));
    }

    #[test]
    fn html_report_writes_index_assets_and_issue_pages() {
        let dir = temp_dir("html");
        let mut by_class = BTreeMap::new();
        by_class.insert(
            "com.example.Bad".to_string(),
            vec![analysis("com.example.Bad", Verdict::Fail, "ALGO_DENIED", "R1")],
        );
        by_class.insert(
            "com.example.Good".to_string(),
            vec![analysis("com.example.Good", Verdict::Pass, "ALLOWED_ALGO", "R1")],
        );

        write_html(&by_class, &dir).expect("write html");

        assert!(dir.join("index.html").exists());
        assert!(dir.join("resources/style.css").exists());
        assert!(dir.join("resources/report.js").exists());
        assert!(dir.join("classes/com_example_Bad.html").exists());
        // Clean classes get no page of their own.
        assert!(!dir.join("classes/com_example_Good.html").exists());

        let index = fs::read_to_string(dir.join("index.html")).expect("read index");
        assert!(index.contains("PASS: 1"));
        assert!(index.contains("FAIL: 1"));
        let page = fs::read_to_string(dir.join("classes/com_example_Bad.html")).expect("page");
        assert!(page.contains("ALGO_DENIED"));
        assert!(page.contains("const ROWS ="));

        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn html_escapes_markup_in_class_names() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[test]
    fn embedded_row_json_cannot_break_out_of_the_script_element() {
        let mut bad = analysis("com.example.Bad", Verdict::Fail, "ALGO_DENIED", "R1");
        bad.finding.args = vec![ArgumentValue::resolved(0, "</script><script>alert(1)")];

        let page = render_class_page("com.example.Bad", &[bad]).expect("render page");

        assert!(!page.contains("</script><script>alert"));
        assert!(page.contains("\\u003c/script>\\u003cscript>alert(1)"));
    }
}
