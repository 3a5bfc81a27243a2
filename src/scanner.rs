use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::descriptor::{parse_method_descriptor, sub_signature};
use crate::finding::{ArgumentValue, Finding, Location};
use crate::ir::{Class, InstructionKind, Method};
use crate::tracker::{resolve_invocation_args, TrackedValue};

/// Match every invocation in the corpus against the catalog and capture
/// argument values. Classes are processed in parallel; the result maps each
/// scanned class to its findings in (method order, instruction order),
/// keyed by class name so downstream iteration is deterministic.
///
/// Cancellation is cooperative at class boundaries: classes observed after
/// `cancel` is raised are dropped and the partial map is returned.
pub(crate) fn find_call_sites(
    classes: &[Class],
    catalog: &Catalog,
    cancel: &AtomicBool,
) -> BTreeMap<String, Vec<Finding>> {
    let arg_specs = catalog.arg_spec_by_api();
    classes
        .par_iter()
        .filter_map(|class| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            debug!("scanning class {}", class.name);
            let mut findings = Vec::new();
            for method in &class.methods {
                if !method.has_body {
                    continue;
                }
                scan_method(class, method, &arg_specs, &mut findings);
            }
            Some((class.name.clone(), findings))
        })
        .collect()
}

fn scan_method(
    class: &Class,
    method: &Method,
    arg_specs: &BTreeMap<String, crate::catalog::ArgSpec>,
    findings: &mut Vec<Finding>,
) {
    let matches_catalog = method.instructions.iter().any(|inst| {
        matches!(&inst.kind, InstructionKind::Invoke(call)
            if arg_specs.contains_key(&Catalog::key(&call.owner, &call.name)))
    });
    if !matches_catalog {
        return;
    }

    // Argument tracking is the expensive part; run it only for methods that
    // actually contain a catalog call.
    let resolved = resolve_invocation_args(method);
    let method_signature = match sub_signature(&method.name, &method.descriptor) {
        Ok(signature) => signature,
        Err(err) => {
            warn!(
                "skipping method {}.{} with bad descriptor {}: {err:#}",
                class.name, method.name, method.descriptor
            );
            return;
        }
    };

    for inst in &method.instructions {
        let InstructionKind::Invoke(call) = &inst.kind else {
            continue;
        };
        let key = Catalog::key(&call.owner, &call.name);
        if !arg_specs.contains_key(&key) {
            continue;
        }
        debug!("found crypto call {key} in {}", class.name);

        let arity = match parse_method_descriptor(&call.descriptor) {
            Ok(sig) => sig.param_count(),
            Err(err) => {
                warn!(
                    "skipping call to {key} with bad descriptor {}: {err:#}",
                    call.descriptor
                );
                continue;
            }
        };
        let values = resolved.get(&inst.offset);
        let args = (0..arity)
            .map(|index| match values.and_then(|v| v.get(index)) {
                Some(TrackedValue::Const(value)) => ArgumentValue::resolved(index, value.clone()),
                _ => ArgumentValue::unresolved(index),
            })
            .collect();

        let call_signature = match sub_signature(&call.name, &call.descriptor) {
            Ok(signature) => signature,
            Err(err) => {
                warn!(
                    "skipping call to {key} with bad descriptor {}: {err:#}",
                    call.descriptor
                );
                continue;
            }
        };
        findings.push(Finding {
            api: format!("{}.{}", call.owner, call.name),
            declaring_class: call.owner.clone(),
            method_name: call.name.clone(),
            sub_signature: call_signature,
            args,
            location: Location {
                class_name: class.name.clone(),
                method_signature: method_signature.clone(),
                source_file: class
                    .source_file
                    .clone()
                    .unwrap_or_else(|| class.name.clone()),
                line: method.line_for_offset(inst.offset),
            },
        });
    }
}
