mod catalog;
mod cfg;
mod descriptor;
mod engine;
mod finding;
mod ir;
mod opcodes;
mod policy;
mod report;
mod scan;
mod scanner;
#[cfg(test)]
mod test_harness;
mod tracker;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::PolicyEngine;
use crate::finding::Analysis;
use crate::scanner::find_call_sites;

/// CLI arguments for jceprobe execution.
#[derive(Parser, Debug)]
#[command(
    name = "jceprobe",
    about = "Scans classes/JARs for JCE usage and evaluates call sites against a compliance policy.",
    version
)]
struct Cli {
    /// Path to a classes directory, a .class file, or a JAR to scan.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Catalog YAML; the bundled JCE catalog is used when omitted.
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
    /// Policy YAML; the bundled FIPS 140-2 L1 policy is used when omitted.
    #[arg(long, value_name = "PATH")]
    policy: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
    /// Destination directory for HTML output; defaults to a reports/
    /// directory next to the input.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Html,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("jceprobe=debug")
    } else {
        EnvFilter::new("jceprobe=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let catalog = match &cli.catalog {
        Some(path) => catalog::load_catalog(path)?,
        None => catalog::load_default_catalog()?,
    };
    let policy = match &cli.policy {
        Some(path) => policy::load_policy(path)?,
        None => policy::load_default_policy()?,
    };
    let engine = PolicyEngine::new(&catalog, &policy)?;

    if cli.verbose {
        println!("Catalog: {} ({} apis)", catalog.catalog_id, catalog.apis.len());
        println!("Policy : {} ({} rules)", policy.policy_id, policy.rules.len());
        println!("Input  : {}", cli.input.display());
    }

    let scan = scan::scan_input(&cli.input)?;
    info!(
        "decoded {} classes from {}",
        scan.class_count,
        cli.input.display()
    );
    if scan.skipped_count > 0 {
        warn!("skipped {} unreadable or malformed entries", scan.skipped_count);
    }

    let cancel = AtomicBool::new(false);
    let findings = find_call_sites(&scan.classes, &catalog, &cancel);
    let analyses: BTreeMap<String, Vec<Analysis>> = findings
        .into_iter()
        .map(|(class_name, class_findings)| {
            let class_analyses = class_findings
                .iter()
                .map(|finding| engine.evaluate(finding))
                .collect();
            (class_name, class_analyses)
        })
        .collect();

    match cli.format {
        OutputFormat::Text => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            report::write_text(&analyses, &mut out).context("write text report")?;
        }
        OutputFormat::Html => {
            let output_dir = cli
                .output
                .clone()
                .unwrap_or_else(|| default_html_dir(&cli.input));
            println!("Writing HTML report to {}", output_dir.display());
            report::write_html(&analyses, &output_dir)?;
        }
    }
    Ok(())
}

fn default_html_dir(input: &Path) -> PathBuf {
    input
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("reports")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::catalog::{ApiEntry, ApiRef, ArgSpec, Catalog};
    use crate::finding::Verdict;
    use crate::opcodes;
    use crate::policy::{MatchSet, Policy, Rule};
    use crate::test_harness::{high, low, ClassFileBuilder};

    const DIGEST_DESC: &str = "(Ljava/lang/String;)Ljava/security/MessageDigest;";
    const CIPHER_DESC: &str = "(Ljava/lang/String;Ljava/lang/String;)Ljavax/crypto/Cipher;";

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

    fn jce_catalog() -> Catalog {
        Catalog {
            catalog_id: "test".to_string(),
            version: None,
            apis: vec![
                ApiEntry {
                    api: ApiRef {
                        class_name: "java.security.MessageDigest".to_string(),
                        method_name: "getInstance".to_string(),
                    },
                    arg_spec: Some(ArgSpec {
                        algorithm_index: Some(0),
                        provider_name_index: Some(1),
                        provider_object_index: Some(1),
                    }),
                },
                ApiEntry {
                    api: ApiRef {
                        class_name: "javax.crypto.Cipher".to_string(),
                        method_name: "getInstance".to_string(),
                    },
                    arg_spec: Some(ArgSpec {
                        algorithm_index: Some(0),
                        provider_name_index: Some(1),
                        provider_object_index: Some(1),
                    }),
                },
            ],
        }
        .normalized()
    }

    fn fips_policy() -> Policy {
        Policy {
            policy_id: "fips-test".to_string(),
            name: None,
            description: None,
            version: None,
            rules: vec![
                Rule {
                    id: Some("R-DIGEST".to_string()),
                    description: None,
                    api: "java.security.MessageDigest.getInstance".to_string(),
                    algorithms: Some(MatchSet {
                        deny: Some(vec!["MD5".to_string()]),
                        allow: Some(vec!["SHA-256".to_string()]),
                        ..MatchSet::default()
                    }),
                    providers: None,
                },
                Rule {
                    id: Some("R-CIPHER".to_string()),
                    description: None,
                    api: "javax.crypto.Cipher.getInstance".to_string(),
                    algorithms: Some(MatchSet {
                        allow_regex: Some(vec!["^AES/.*".to_string()]),
                        ..MatchSet::default()
                    }),
                    providers: Some(MatchSet {
                        deny: Some(vec!["BC".to_string()]),
                        ..MatchSet::default()
                    }),
                },
            ],
        }
        .normalized()
    }

    fn analyze_dir(dir: &Path) -> BTreeMap<String, Vec<Analysis>> {
        let catalog = jce_catalog();
        let policy = fips_policy();
        let engine = PolicyEngine::new(&catalog, &policy).expect("engine");
        let scan = scan::scan_input(dir).expect("scan input");
        let cancel = AtomicBool::new(false);
        let findings = find_call_sites(&scan.classes, &catalog, &cancel);
        findings
            .into_iter()
            .map(|(class_name, class_findings)| {
                let class_analyses = class_findings
                    .iter()
                    .map(|finding| engine.evaluate(finding))
                    .collect();
                (class_name, class_analyses)
            })
            .collect()
    }

    fn digest_literal_class(name: &str, algorithm: &str) -> Vec<u8> {
        let mut builder = ClassFileBuilder::new(name);
        let digest =
            builder.add_method_ref("java/security/MessageDigest", "getInstance", DIGEST_DESC);
        let algo = builder.add_string(algorithm);
        let code = vec![
            opcodes::LDC,
            algo as u8,
            opcodes::INVOKESTATIC,
            high(digest),
            low(digest),
            opcodes::POP,
            opcodes::RETURN,
        ];
        builder.add_method(0x0009, "run", "()V", code);
        builder.finish()
    }

    #[test]
    fn denied_literal_algorithm_fails_end_to_end() {
        let dir = temp_dir("e2e-md5");
        fs::write(dir.join("App.class"), digest_literal_class("App", "MD5"))
            .expect("write class");

        let analyses = analyze_dir(&dir);
        let app = analyses.get("App").expect("analyses");
        assert_eq!(app.len(), 1);
        assert_eq!(app[0].verdict, Verdict::Fail);
        assert_eq!(app[0].reason.as_deref(), Some("ALGO_DENIED"));
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn literal_via_local_variable_passes_end_to_end() {
        let dir = temp_dir("e2e-local");
        let mut builder = ClassFileBuilder::new("App");
        let digest =
            builder.add_method_ref("java/security/MessageDigest", "getInstance", DIGEST_DESC);
        let algo = builder.add_string("SHA-256");
        // String a = "SHA-256"; MessageDigest.getInstance(a);
        let code = vec![
            opcodes::LDC,
            algo as u8,
            opcodes::ASTORE_0 + 1,
            opcodes::ALOAD_0 + 1,
            opcodes::INVOKESTATIC,
            high(digest),
            low(digest),
            opcodes::POP,
            opcodes::RETURN,
        ];
        builder.add_method(0x0009, "run", "()V", code);
        fs::write(dir.join("App.class"), builder.finish()).expect("write class");

        let analyses = analyze_dir(&dir);
        let app = analyses.get("App").expect("analyses");
        assert_eq!(app[0].verdict, Verdict::Pass);
        // Single-argument overload: the provider stays at its default.
        assert_eq!(
            app[0].reason.as_deref(),
            Some("ALLOWED_ALGO_DEFAULT_PROVIDER")
        );
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn unresolvable_algorithm_is_unknown_end_to_end() {
        let dir = temp_dir("e2e-unknown");
        let mut builder = ClassFileBuilder::new("App");
        let supplier = builder.add_method_ref("App", "algo", "()Ljava/lang/String;");
        let digest =
            builder.add_method_ref("java/security/MessageDigest", "getInstance", DIGEST_DESC);
        // MessageDigest.getInstance(algo());
        let code = vec![
            opcodes::INVOKESTATIC,
            high(supplier),
            low(supplier),
            opcodes::INVOKESTATIC,
            high(digest),
            low(digest),
            opcodes::POP,
            opcodes::RETURN,
        ];
        builder.add_method(0x0009, "run", "()V", code);
        fs::write(dir.join("App.class"), builder.finish()).expect("write class");

        let analyses = analyze_dir(&dir);
        let app = analyses.get("App").expect("analyses");
        assert_eq!(app[0].verdict, Verdict::Unknown);
        assert_eq!(app[0].reason.as_deref(), Some("ALGO_UNRESOLVED"));
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    fn cipher_class(provider: &str) -> Vec<u8> {
        let mut builder = ClassFileBuilder::new("App");
        let cipher = builder.add_method_ref("javax/crypto/Cipher", "getInstance", CIPHER_DESC);
        let algo = builder.add_string("AES/GCM/NoPadding");
        let prov = builder.add_string(provider);
        let code = vec![
            opcodes::LDC,
            algo as u8,
            opcodes::LDC,
            prov as u8,
            opcodes::INVOKESTATIC,
            high(cipher),
            low(cipher),
            opcodes::POP,
            opcodes::RETURN,
        ];
        builder.add_method(0x0009, "run", "()V", code);
        builder.finish()
    }

    #[test]
    fn allowed_cipher_with_clean_provider_passes_end_to_end() {
        let dir = temp_dir("e2e-cipher");
        fs::write(dir.join("App.class"), cipher_class("SunJCE")).expect("write class");

        let analyses = analyze_dir(&dir);
        let app = analyses.get("App").expect("analyses");
        assert_eq!(app[0].verdict, Verdict::Pass);
        assert_eq!(app[0].reason.as_deref(), Some("ALLOWED_ALGO"));
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn denied_provider_fails_end_to_end() {
        let dir = temp_dir("e2e-provider");
        fs::write(dir.join("App.class"), cipher_class("BC")).expect("write class");

        let analyses = analyze_dir(&dir);
        let app = analyses.get("App").expect("analyses");
        assert_eq!(app[0].verdict, Verdict::Fail);
        assert_eq!(app[0].reason.as_deref(), Some("PROVIDER_DENIED:BC"));
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn api_without_rule_reports_no_policy_rule() {
        let dir = temp_dir("e2e-norule");
        let mut builder = ClassFileBuilder::new("App");
        let mac = builder.add_method_ref(
            "javax/crypto/Mac",
            "getInstance",
            "(Ljava/lang/String;)Ljavax/crypto/Mac;",
        );
        let algo = builder.add_string("HmacSHA256");
        let code = vec![
            opcodes::LDC,
            algo as u8,
            opcodes::INVOKESTATIC,
            high(mac),
            low(mac),
            opcodes::POP,
            opcodes::RETURN,
        ];
        builder.add_method(0x0009, "run", "()V", code);
        fs::write(dir.join("App.class"), builder.finish()).expect("write class");

        // The catalog knows the Mac API but the policy has no rule for it.
        let mut catalog = jce_catalog();
        catalog.apis.push(ApiEntry {
            api: ApiRef {
                class_name: "javax.crypto.Mac".to_string(),
                method_name: "getInstance".to_string(),
            },
            arg_spec: None,
        });
        let catalog = catalog.normalized();
        let policy = fips_policy();
        let engine = PolicyEngine::new(&catalog, &policy).expect("engine");
        let scan = scan::scan_input(&dir).expect("scan input");
        let cancel = AtomicBool::new(false);
        let findings = find_call_sites(&scan.classes, &catalog, &cancel);
        let analyses: Vec<Analysis> = findings
            .get("App")
            .expect("findings")
            .iter()
            .map(|finding| engine.evaluate(finding))
            .collect();

        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].verdict, Verdict::Unknown);
        assert_eq!(analyses[0].rule_id, "NO_POLICY_RULE");
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }

    #[test]
    fn default_catalog_and_policy_flag_md5_end_to_end() {
        let dir = temp_dir("e2e-defaults");
        fs::write(dir.join("App.class"), digest_literal_class("App", "md5"))
            .expect("write class");

        let catalog = catalog::load_default_catalog().expect("default catalog");
        let policy = policy::load_default_policy().expect("default policy");
        let engine = PolicyEngine::new(&catalog, &policy).expect("engine");
        let scan = scan::scan_input(&dir).expect("scan input");
        let cancel = AtomicBool::new(false);
        let findings = find_call_sites(&scan.classes, &catalog, &cancel);
        let analyses: Vec<Analysis> = findings
            .get("App")
            .expect("findings")
            .iter()
            .map(|finding| engine.evaluate(finding))
            .collect();

        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].verdict, Verdict::Fail);
        assert_eq!(analyses[0].reason.as_deref(), Some("ALGO_DENIED"));
        fs::remove_dir_all(&dir).expect("cleanup temp dir");
    }
}
