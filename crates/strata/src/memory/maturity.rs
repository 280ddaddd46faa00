//! Rule maturity and effectiveness engine
//!
//! Rules climb candidate -> established -> proven on positive feedback and
//! fall back on negative feedback. Repeatedly harmful rules are inverted
//! into anti-patterns: standing negative-guidance warnings that are never
//! purged. Every feedback call re-evaluates the state machine so counters,
//! effectiveness, and maturity always move together.

use chrono::{DateTime, Duration, Utc};

use crate::memory::types::{Maturity, Rule};

/// Harmful evidence is weighted 4x against successes.
const HARMFUL_WEIGHT: f64 = 4.0;

/// Minimum successes for candidate -> established.
const ESTABLISHED_MIN_SUCCESS: u32 = 5;
/// Minimum effectiveness for established maturity.
const ESTABLISHED_MIN_EFFECTIVENESS: f64 = 0.6;
/// Minimum successes for established -> proven.
const PROVEN_MIN_SUCCESS: u32 = 15;
/// Minimum effectiveness for proven maturity.
const PROVEN_MIN_EFFECTIVENESS: f64 = 0.8;
/// Minimum age for proven maturity.
const PROVEN_MIN_AGE_DAYS: i64 = 30;
/// Harmful count triggering anti-pattern inversion.
const ANTI_PATTERN_MIN_HARMFUL: u32 = 3;
/// Effectiveness below which inversion fires.
const ANTI_PATTERN_MAX_EFFECTIVENESS: f64 = 0.3;

/// Feedback kind reported by a caller after applying a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    Helpful,
    Harmful,
}

/// Outcome of a maturity evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaturityChange {
    Unchanged,
    Promoted(Maturity),
    Demoted(Maturity),
    Inverted,
}

/// `success / (success + 4*harmful + 0.01)`. The epsilon keeps the
/// zero-feedback case at 0.0 instead of dividing by zero.
pub fn effectiveness(success_count: u32, harmful_count: u32) -> f64 {
    let success = success_count as f64;
    let harmful = harmful_count as f64;
    success / (success + HARMFUL_WEIGHT * harmful + 0.01)
}

/// Apply one feedback report to a rule: bump counters, recalculate
/// effectiveness, and run the promotion/demotion/inversion state machine.
/// The caller persists the mutated rule atomically.
pub fn apply_feedback(
    rule: &mut Rule,
    feedback: Feedback,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> MaturityChange {
    rule.applied_count += 1;
    match feedback {
        Feedback::Helpful => rule.success_count += 1,
        Feedback::Harmful => {
            rule.harmful_count += 1;
            if let Some(reason) = reason {
                rule.harmful_reasons.push(reason);
            }
        }
    }
    rule.effectiveness = effectiveness(rule.success_count, rule.harmful_count);
    rule.last_applied_at = Some(now);
    rule.last_evaluated_at = Some(now);

    let change = evaluate(rule, now);
    match change {
        MaturityChange::Promoted(m) | MaturityChange::Demoted(m) => rule.maturity = m,
        MaturityChange::Inverted => {
            rule.maturity = Maturity::AntiPattern;
            rule.content = anti_pattern_content(&rule.content, &rule.harmful_reasons);
        }
        MaturityChange::Unchanged => {}
    }
    change
}

/// Pure evaluation of the next maturity state. Inversion is checked
/// first: a rule that keeps causing harm becomes a warning regardless of
/// where it sits on the promotion ladder. Anti-patterns are final.
fn evaluate(rule: &Rule, now: DateTime<Utc>) -> MaturityChange {
    if rule.maturity == Maturity::AntiPattern {
        return MaturityChange::Unchanged;
    }

    if rule.harmful_count >= ANTI_PATTERN_MIN_HARMFUL
        && rule.effectiveness < ANTI_PATTERN_MAX_EFFECTIVENESS
    {
        return MaturityChange::Inverted;
    }

    match rule.maturity {
        Maturity::Candidate => {
            if rule.success_count >= ESTABLISHED_MIN_SUCCESS
                && rule.effectiveness >= ESTABLISHED_MIN_EFFECTIVENESS
            {
                MaturityChange::Promoted(Maturity::Established)
            } else {
                MaturityChange::Unchanged
            }
        }
        Maturity::Established => {
            if rule.effectiveness < ESTABLISHED_MIN_EFFECTIVENESS {
                MaturityChange::Demoted(Maturity::Candidate)
            } else if rule.success_count >= PROVEN_MIN_SUCCESS
                && rule.effectiveness >= PROVEN_MIN_EFFECTIVENESS
                && now - rule.created_at >= Duration::days(PROVEN_MIN_AGE_DAYS)
            {
                MaturityChange::Promoted(Maturity::Proven)
            } else {
                MaturityChange::Unchanged
            }
        }
        Maturity::Proven => {
            if rule.effectiveness < PROVEN_MIN_EFFECTIVENESS {
                MaturityChange::Demoted(Maturity::Established)
            } else {
                MaturityChange::Unchanged
            }
        }
        Maturity::AntiPattern => MaturityChange::Unchanged,
    }
}

/// Rewrite rule content into an explicit negative-guidance warning,
/// keeping the accumulated harmful reasons visible.
fn anti_pattern_content(original: &str, harmful_reasons: &[String]) -> String {
    let mut content = format!("AVOID: {original}");
    if !harmful_reasons.is_empty() {
        content.push_str("\nObserved harm: ");
        content.push_str(&harmful_reasons.join("; "));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rule() -> Rule {
        Rule::new("acme", "always rebase before merging".to_string(), vec![])
    }

    #[test]
    fn test_effectiveness_formula() {
        let value = effectiveness(10, 2);
        let expected = 10.0 / (10.0 + 8.0 + 0.01);
        assert!((value - expected).abs() < 1e-9);
        assert!((value - 0.5552).abs() < 0.001);
    }

    #[test]
    fn test_effectiveness_zero_feedback() {
        assert_eq!(effectiveness(0, 0), 0.0);
    }

    #[test]
    fn test_candidate_promotes_at_five_successes() {
        let mut rule = test_rule();
        let now = Utc::now();
        for _ in 0..4 {
            let change = apply_feedback(&mut rule, Feedback::Helpful, None, now);
            assert_eq!(change, MaturityChange::Unchanged);
        }
        let change = apply_feedback(&mut rule, Feedback::Helpful, None, now);
        assert_eq!(change, MaturityChange::Promoted(Maturity::Established));
        assert_eq!(rule.maturity, Maturity::Established);
        assert!(rule.effectiveness >= 0.6);
    }

    #[test]
    fn test_candidate_with_low_effectiveness_stays_candidate() {
        let mut rule = test_rule();
        rule.success_count = 5;
        rule.harmful_count = 2;
        rule.effectiveness = effectiveness(5, 2);
        assert!(rule.effectiveness < 0.6);
        // One more success keeps effectiveness below the bar.
        apply_feedback(&mut rule, Feedback::Helpful, None, Utc::now());
        assert_eq!(rule.maturity, Maturity::Candidate);
    }

    #[test]
    fn test_established_promotes_to_proven_after_thirty_days() {
        let mut rule = test_rule();
        rule.maturity = Maturity::Established;
        rule.success_count = 15;
        rule.created_at = Utc::now() - Duration::days(31);

        let change = apply_feedback(&mut rule, Feedback::Helpful, None, Utc::now());
        assert_eq!(change, MaturityChange::Promoted(Maturity::Proven));
    }

    #[test]
    fn test_established_too_young_for_proven() {
        let mut rule = test_rule();
        rule.maturity = Maturity::Established;
        rule.success_count = 20;
        rule.created_at = Utc::now() - Duration::days(5);

        let change = apply_feedback(&mut rule, Feedback::Helpful, None, Utc::now());
        assert_eq!(change, MaturityChange::Unchanged);
        assert_eq!(rule.maturity, Maturity::Established);
    }

    #[test]
    fn test_established_demotes_on_harm() {
        let mut rule = test_rule();
        rule.maturity = Maturity::Established;
        rule.success_count = 5;
        rule.harmful_count = 0;

        // Two harmful reports drop effectiveness below 0.6 without
        // reaching the inversion bar.
        apply_feedback(&mut rule, Feedback::Harmful, None, Utc::now());
        assert_eq!(rule.maturity, Maturity::Candidate);
    }

    #[test]
    fn test_proven_demotes_to_established() {
        let mut rule = test_rule();
        rule.maturity = Maturity::Proven;
        rule.success_count = 15;
        rule.harmful_count = 0;

        apply_feedback(&mut rule, Feedback::Harmful, None, Utc::now());
        assert!(rule.effectiveness < 0.8);
        assert_eq!(rule.maturity, Maturity::Established);
    }

    #[test]
    fn test_anti_pattern_inversion() {
        let mut rule = test_rule();
        rule.success_count = 1;
        rule.harmful_count = 2;
        rule.effectiveness = effectiveness(1, 2);

        let change = apply_feedback(
            &mut rule,
            Feedback::Harmful,
            Some("broke the release build".to_string()),
            Utc::now(),
        );
        assert_eq!(change, MaturityChange::Inverted);
        assert_eq!(rule.maturity, Maturity::AntiPattern);
        assert!(rule.content.starts_with("AVOID: always rebase"));
        assert!(rule.content.contains("broke the release build"));
    }

    #[test]
    fn test_inversion_requires_both_conditions() {
        // Three harmful reports but effectiveness above 0.3: no inversion.
        let mut rule = test_rule();
        rule.success_count = 20;
        rule.harmful_count = 2;
        apply_feedback(&mut rule, Feedback::Harmful, None, Utc::now());
        assert!(rule.effectiveness >= 0.3);
        assert_ne!(rule.maturity, Maturity::AntiPattern);
    }

    #[test]
    fn test_anti_pattern_is_final() {
        let mut rule = test_rule();
        rule.maturity = Maturity::AntiPattern;
        rule.content = "AVOID: something".to_string();

        let change = apply_feedback(&mut rule, Feedback::Helpful, None, Utc::now());
        assert_eq!(change, MaturityChange::Unchanged);
        assert_eq!(rule.maturity, Maturity::AntiPattern);
    }

    #[test]
    fn test_promotion_threshold_boundaries() {
        // success=5, effectiveness=0.7 -> promoted.
        let mut promoted = test_rule();
        promoted.success_count = 5;
        promoted.harmful_count = 0;
        promoted.effectiveness = 0.7;
        assert_eq!(
            evaluate(&promoted, Utc::now()),
            MaturityChange::Promoted(Maturity::Established)
        );

        // success=5, effectiveness=0.4 -> not promoted.
        let mut held = test_rule();
        held.success_count = 5;
        held.harmful_count = 2;
        held.effectiveness = 0.4;
        assert_eq!(evaluate(&held, Utc::now()), MaturityChange::Unchanged);

        // harmful=3, effectiveness=0.2 -> inverted.
        let mut inverted = test_rule();
        inverted.success_count = 1;
        inverted.harmful_count = 3;
        inverted.effectiveness = 0.2;
        assert_eq!(evaluate(&inverted, Utc::now()), MaturityChange::Inverted);
    }
}
