// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Periodic reconciler for the FORWARD rules that let overlay traffic
//! through the host firewall.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How often the rules are checked and, if anything is missing, re-installed.
const RESYNC_PERIOD: Duration = Duration::from_secs(5);

/// One iptables rule, fully specified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: String,
}

/// The two FORWARD ACCEPT rules for traffic to or from the overlay network.
pub(crate) fn forward_rules(network: &str) -> Vec<Rule> {
    vec![
        Rule {
            table: "filter",
            chain: "FORWARD",
            spec: format!("-s {network} -j ACCEPT"),
        },
        Rule {
            table: "filter",
            chain: "FORWARD",
            spec: format!("-d {network} -j ACCEPT"),
        },
    ]
}

/// The iptables operations the reconciler consumes.  Implemented over the
/// system iptables binary; the seam keeps the resync logic testable.
pub(crate) trait RuleSet {
    fn has_rule(&self, rule: &Rule) -> Result<bool, String>;
    fn append_rule(&self, rule: &Rule) -> Result<(), String>;
    fn delete_rule(&self, rule: &Rule) -> Result<(), String>;
}

impl RuleSet for iptables::IPTables {
    fn has_rule(&self, rule: &Rule) -> Result<bool, String> {
        self.exists(rule.table, rule.chain, &rule.spec)
            .map_err(|err| err.to_string())
    }

    fn append_rule(&self, rule: &Rule) -> Result<(), String> {
        self.append(rule.table, rule.chain, &rule.spec)
            .map_err(|err| err.to_string())
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), String> {
        self.delete(rule.table, rule.chain, &rule.spec)
            .map_err(|err| err.to_string())
    }
}

/// Keep `rules` in place until cancelled, then remove them.
///
/// A host without an iptables binary gets an error log and no supervision;
/// the overlay still works wherever forwarding is open by default.
pub(crate) async fn supervise(rules: Vec<Rule>, token: CancellationToken) {
    let ipt = match iptables::new(false) {
        Ok(ipt) => ipt,
        Err(err) => {
            error!("failed to set up iptables: iptables binary was not found: {err}");
            return;
        }
    };
    loop {
        if let Err(err) = ensure_rules(&ipt, &rules) {
            error!("failed to ensure iptables rules: {err}");
        }
        tokio::select! {
            () = token.cancelled() => break,
            () = sleep(RESYNC_PERIOD) => {}
        }
    }
    teardown_rules(&ipt, &rules);
}

/// If any rule is missing, delete and re-add all of them: the order of the
/// rules matters, so a partial set is rebuilt rather than patched.
fn ensure_rules(set: &impl RuleSet, rules: &[Rule]) -> Result<(), String> {
    for rule in rules {
        if !set.has_rule(rule)? {
            info!("some iptables rules are missing; deleting and recreating rules");
            teardown_rules(set, rules);
            return setup_rules(set, rules);
        }
    }
    Ok(())
}

fn setup_rules(set: &impl RuleSet, rules: &[Rule]) -> Result<(), String> {
    for rule in rules {
        info!("adding iptables rule: {}", rule.spec);
        set.append_rule(rule)?;
    }
    Ok(())
}

fn teardown_rules(set: &impl RuleSet, rules: &[Rule]) {
    for rule in rules {
        info!("deleting iptables rule: {}", rule.spec);
        // a rule that is already gone is fine
        let _ = set.delete_rule(rule);
    }
}

#[cfg(test)]
mod tests {
    use super::{Rule, RuleSet, ensure_rules, forward_rules, teardown_rules};
    use std::cell::RefCell;

    struct FakeRules {
        present: RefCell<Vec<Rule>>,
        ops: RefCell<Vec<String>>,
    }

    impl FakeRules {
        fn with(present: Vec<Rule>) -> FakeRules {
            FakeRules {
                present: RefCell::new(present),
                ops: RefCell::new(Vec::new()),
            }
        }
    }

    impl RuleSet for FakeRules {
        fn has_rule(&self, rule: &Rule) -> Result<bool, String> {
            Ok(self.present.borrow().contains(rule))
        }

        fn append_rule(&self, rule: &Rule) -> Result<(), String> {
            self.ops.borrow_mut().push(format!("append {}", rule.spec));
            self.present.borrow_mut().push(rule.clone());
            Ok(())
        }

        fn delete_rule(&self, rule: &Rule) -> Result<(), String> {
            self.ops.borrow_mut().push(format!("delete {}", rule.spec));
            let mut present = self.present.borrow_mut();
            match present.iter().position(|have| have == rule) {
                Some(at) => {
                    present.remove(at);
                    Ok(())
                }
                None => Err("rule not found".to_string()),
            }
        }
    }

    #[test]
    fn complete_rules_are_left_alone() {
        let rules = forward_rules("10.5.0.0/16");
        let set = FakeRules::with(rules.clone());
        ensure_rules(&set, &rules).unwrap();
        assert!(set.ops.borrow().is_empty());
    }

    #[test]
    fn a_missing_rule_rebuilds_the_whole_set_in_order() {
        let rules = forward_rules("10.5.0.0/16");
        // only the second rule survived; ordering matters, so everything is
        // torn down and re-added
        let set = FakeRules::with(vec![rules[1].clone()]);
        ensure_rules(&set, &rules).unwrap();
        assert_eq!(
            *set.ops.borrow(),
            vec![
                "delete -s 10.5.0.0/16 -j ACCEPT",
                "delete -d 10.5.0.0/16 -j ACCEPT",
                "append -s 10.5.0.0/16 -j ACCEPT",
                "append -d 10.5.0.0/16 -j ACCEPT",
            ]
        );
        assert_eq!(*set.present.borrow(), rules);
    }

    #[test]
    fn teardown_ignores_rules_that_are_already_gone() {
        let rules = forward_rules("10.5.0.0/16");
        let set = FakeRules::with(vec![rules[0].clone()]);
        teardown_rules(&set, &rules);
        assert!(set.present.borrow().is_empty());
    }
}
