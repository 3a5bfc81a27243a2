use std::collections::BTreeMap;

use crate::catalog::{ArgSpec, Catalog};
use crate::finding::{Analysis, Finding, Verdict};
use crate::policy::{compile_rules, CompiledMatchSet, CompiledRule, Policy, PolicyLoadError};

/// Synthetic rule id when no rule matches the finding's API.
const NO_POLICY_RULE: &str = "NO_POLICY_RULE";
/// Synthetic rule id when matching rules produced no verdict.
const NO_DECISION: &str = "NO_DECISION";

/// Deterministic verdict computation for findings against one policy.
/// Pure and stateless after construction; safe to share across threads.
pub(crate) struct PolicyEngine {
    arg_specs: BTreeMap<String, ArgSpec>,
    policy_id: String,
    rules: Vec<CompiledRule>,
}

impl PolicyEngine {
    pub(crate) fn new(catalog: &Catalog, policy: &Policy) -> Result<Self, PolicyLoadError> {
        Ok(Self {
            arg_specs: catalog.arg_spec_by_api(),
            policy_id: policy.policy_id.clone(),
            rules: compile_rules(policy)?,
        })
    }

    /// Evaluate one finding. Applicable rules are visited in policy order;
    /// PASS and UNKNOWN short-circuit, the earliest FAIL is kept as the
    /// fallback result.
    pub(crate) fn evaluate(&self, finding: &Finding) -> Analysis {
        let applicable: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|rule| rule.api == finding.api)
            .collect();

        if applicable.is_empty() {
            return self.result(finding, NO_POLICY_RULE, Verdict::Unknown, "No rule for API");
        }

        let mut first_fail = None;
        for rule in applicable {
            let analysis = self.evaluate_against_rule(finding, rule);
            match analysis.verdict {
                Verdict::Pass | Verdict::Unknown => return analysis,
                Verdict::Fail => {
                    if first_fail.is_none() {
                        first_fail = Some(analysis);
                    }
                }
            }
        }

        first_fail
            .unwrap_or_else(|| self.result(finding, NO_DECISION, Verdict::Unknown, NO_DECISION))
    }

    fn evaluate_against_rule(&self, finding: &Finding, rule: &CompiledRule) -> Analysis {
        let rule_id = rule.id_or_default();

        if !self.has_algorithm_arg(finding) {
            return self.result(finding, rule_id, Verdict::Pass, "DEFAULT_ALGO_ALLOWED");
        }

        let Some(algorithm) = self.algorithm_literal(finding) else {
            return self.result(finding, rule_id, Verdict::Unknown, "ALGO_UNRESOLVED");
        };

        let Some(algorithms) = rule.algorithms.as_ref() else {
            return self.result(finding, rule_id, Verdict::Unknown, "NO_ALGORITHM_POLICY");
        };

        if matches_denied(algorithms, algorithm) {
            return self.result(finding, rule_id, Verdict::Fail, "ALGO_DENIED");
        }

        // A non-null allow list is restrictive even when empty.
        if (algorithms.allow.is_some() || algorithms.allow_regex.is_some())
            && !matches_allowed(algorithms, algorithm)
        {
            return self.result(finding, rule_id, Verdict::Fail, "ALGO_NOT_ALLOWED");
        }

        if !self.has_provider_arg(finding) {
            return self.result(
                finding,
                rule_id,
                Verdict::Pass,
                "ALLOWED_ALGO_DEFAULT_PROVIDER",
            );
        }

        let Some(provider) = self.provider_literal(finding) else {
            return self.result(finding, rule_id, Verdict::Unknown, "PROVIDER_UNRESOLVED");
        };

        let provider_upper = provider.to_uppercase();
        if let Some(providers) = rule.providers.as_ref() {
            if providers
                .deny
                .as_ref()
                .is_some_and(|deny| deny.contains(&provider_upper))
            {
                return self.result(
                    finding,
                    rule_id,
                    Verdict::Fail,
                    &format!("PROVIDER_DENIED:{provider}"),
                );
            }
            if providers
                .allow
                .as_ref()
                .is_some_and(|allow| !allow.is_empty() && !allow.contains(&provider_upper))
            {
                return self.result(
                    finding,
                    rule_id,
                    Verdict::Fail,
                    &format!("PROVIDER_NOT_ALLOWED:{provider}"),
                );
            }
        }

        self.result(finding, rule_id, Verdict::Pass, "ALLOWED_ALGO")
    }

    fn arg_spec(&self, finding: &Finding) -> Option<&ArgSpec> {
        self.arg_specs
            .get(&Catalog::key(&finding.declaring_class, &finding.method_name))
    }

    fn has_algorithm_arg(&self, finding: &Finding) -> bool {
        self.arg_spec(finding)
            .and_then(|spec| spec.algorithm_index)
            .is_some_and(|index| index >= 0 && (index as usize) < finding.args.len())
    }

    fn algorithm_literal<'f>(&self, finding: &'f Finding) -> Option<&'f str> {
        let index = self.arg_spec(finding)?.algorithm_index?;
        if index < 0 {
            return None;
        }
        finding.args.get(index as usize)?.literal.as_deref()
    }

    fn has_provider_arg(&self, finding: &Finding) -> bool {
        self.arg_spec(finding)
            .and_then(|spec| spec.provider_name_index)
            .is_some_and(|index| index >= 0 && (index as usize) < finding.args.len())
    }

    fn provider_literal<'f>(&self, finding: &'f Finding) -> Option<&'f str> {
        let index = self.arg_spec(finding)?.provider_name_index?;
        if index < 0 {
            return None;
        }
        finding.args.get(index as usize)?.literal.as_deref()
    }

    fn result(&self, finding: &Finding, rule_id: &str, verdict: Verdict, reason: &str) -> Analysis {
        let rule_id = if rule_id.trim().is_empty() {
            "RULE"
        } else {
            rule_id
        };
        Analysis {
            finding: finding.clone(),
            policy_id: self.policy_id.clone(),
            rule_id: rule_id.to_string(),
            verdict,
            reason: Some(reason.to_string()),
        }
    }
}

fn matches_denied(set: &CompiledMatchSet, algorithm: &str) -> bool {
    let upper = algorithm.to_uppercase();
    if set.deny.as_ref().is_some_and(|deny| deny.contains(&upper)) {
        return true;
    }
    set.deny_regex
        .as_ref()
        .is_some_and(|patterns| patterns.iter().any(|regex| regex.is_match(&upper)))
}

fn matches_allowed(set: &CompiledMatchSet, algorithm: &str) -> bool {
    let upper = algorithm.to_uppercase();
    if set
        .allow
        .as_ref()
        .is_some_and(|allow| allow.contains(&upper))
    {
        return true;
    }
    set.allow_regex
        .as_ref()
        .is_some_and(|patterns| patterns.iter().any(|regex| regex.is_match(&upper)))
}
