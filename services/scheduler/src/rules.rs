//! Placement rule evaluation.
//!
//! Equality operators compare strings; a missing attribute compares as the
//! literal `"nil"`. Ordering operators parse both sides as integers and never
//! match a missing attribute or a non-numeric value.

use std::collections::BTreeMap;

use corral_proto::{Operator, Rule};

/// Placeholder a missing attribute compares equal to.
pub const MISSING: &str = "nil";

pub fn rule_matches(rule: &Rule, attributes: &BTreeMap<String, String>) -> bool {
    let actual = attributes.get(&rule.key);

    match rule.op {
        Operator::Eq => actual.map_or(MISSING, String::as_str) == rule.value,
        Operator::NotEq => actual.map_or(MISSING, String::as_str) != rule.value,
        Operator::Gt => numeric(actual, &rule.value).is_some_and(|(l, r)| l > r),
        Operator::GtEq => numeric(actual, &rule.value).is_some_and(|(l, r)| l >= r),
        Operator::Lt => numeric(actual, &rule.value).is_some_and(|(l, r)| l < r),
        Operator::LtEq => numeric(actual, &rule.value).is_some_and(|(l, r)| l <= r),
    }
}

fn numeric(actual: Option<&String>, expected: &str) -> Option<(i64, i64)> {
    let lhs = actual?.trim().parse().ok()?;
    let rhs = expected.trim().parse().ok()?;
    Some((lhs, rhs))
}

/// The first rule the attributes fail, if any.
pub fn first_unmatched<'a>(
    rules: &'a [Rule],
    attributes: &BTreeMap<String, String>,
) -> Option<&'a Rule> {
    rules.iter().find(|rule| !rule_matches(rule, attributes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(Operator::Eq, "prod", &[("env", "prod")], true)]
    #[case(Operator::Eq, "prod", &[("env", "dev")], false)]
    #[case(Operator::NotEq, "prod", &[("env", "dev")], true)]
    #[case(Operator::Eq, "nil", &[], true)]
    #[case(Operator::NotEq, "nil", &[], false)]
    #[case(Operator::NotEq, "prod", &[], true)]
    #[case(Operator::Gt, "4", &[("env", "8")], true)]
    #[case(Operator::Gt, "8", &[("env", "8")], false)]
    #[case(Operator::GtEq, "8", &[("env", "8")], true)]
    #[case(Operator::Lt, "10", &[("env", "9")], true)]
    #[case(Operator::LtEq, "9", &[("env", "10")], false)]
    #[case(Operator::Gt, "nil", &[], false)]
    #[case(Operator::Gt, "0", &[], false)]
    #[case(Operator::Lt, "5", &[("env", "abc")], false)]
    #[case(Operator::Gt, "-5", &[("env", "-1")], true)]
    fn test_rule_semantics(
        #[case] op: Operator,
        #[case] value: &str,
        #[case] pairs: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        let rule = Rule::new("env", op, value);
        assert_eq!(rule_matches(&rule, &attrs(pairs)), expected);
    }

    #[test]
    fn test_numeric_not_lexical() {
        // "10" < "9" lexically, but not numerically
        let rule = Rule::new("cpus", Operator::Gt, "9");
        assert!(rule_matches(&rule, &attrs(&[("cpus", "10")])));
    }

    #[test]
    fn test_first_unmatched_short_circuits_in_order() {
        let rules = vec![
            Rule::new("env", Operator::Eq, "prod"),
            Rule::new("zone", Operator::Eq, "a"),
        ];
        let failed = first_unmatched(&rules, &attrs(&[("env", "dev"), ("zone", "b")]));
        assert_eq!(failed.unwrap().key, "env");
        assert!(first_unmatched(&rules, &attrs(&[("env", "prod"), ("zone", "a")])).is_none());
    }
}
