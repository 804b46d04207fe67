use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// Upserts `new_condition` into `conditions`, returning the resulting list and
/// whether anything differs from the input.
///
/// An existing condition of the same type is updated in place. Its
/// `last_transition_time` only moves when the status value flips, so a
/// reason or message change alone keeps the original transition time.
/// A condition of a new type is appended with the transition time set to now.
pub fn set_status_condition(
    conditions: &[Condition],
    mut new_condition: Condition,
) -> (Vec<Condition>, bool) {
    let mut updated = conditions.to_vec();

    let Some(existing) = updated.iter_mut().find(|c| c.type_ == new_condition.type_) else {
        new_condition.last_transition_time = Time(Utc::now());
        updated.push(new_condition);
        return (updated, true);
    };

    let mut changed = false;
    if existing.status != new_condition.status {
        existing.status = new_condition.status;
        existing.last_transition_time = Time(Utc::now());
        changed = true;
    }
    if existing.reason != new_condition.reason {
        existing.reason = new_condition.reason;
        changed = true;
    }
    if existing.message != new_condition.message {
        existing.message = new_condition.message;
        changed = true;
    }
    if existing.observed_generation != new_condition.observed_generation {
        existing.observed_generation = new_condition.observed_generation;
        changed = true;
    }

    (updated, changed)
}

pub fn find_status_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Returns true when the condition_type is present and set to `True`
pub fn is_status_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    find_status_condition(conditions, condition_type).is_some_and(|c| c.status == CONDITION_TRUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ready(status: &str, reason: &str, message: &str) -> Condition {
        Condition {
            type_: "Ready".to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(Utc::now()),
            observed_generation: Some(1),
        }
    }

    #[test]
    fn appends_new_condition() {
        let (conditions, changed) = set_status_condition(&[], ready("True", "AllMembersReady", "3/3"));
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert!(is_status_condition_true(&conditions, "Ready"));
    }

    #[test]
    fn identical_condition_is_not_a_change() {
        let (conditions, _) = set_status_condition(&[], ready("True", "AllMembersReady", "3/3"));
        let before = conditions[0].last_transition_time.clone();

        let (after, changed) = set_status_condition(&conditions, ready("True", "AllMembersReady", "3/3"));
        assert!(!changed);
        assert_eq!(after[0].last_transition_time, before);
    }

    #[test]
    fn transition_time_moves_only_on_status_flip() {
        let old = Time(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        let mut existing = ready("False", "MembersNotReady", "1/3");
        existing.last_transition_time = old.clone();

        let (conditions, changed) =
            set_status_condition(&[existing.clone()], ready("False", "MembersNotReady", "2/3"));
        assert!(changed);
        assert_eq!(conditions[0].message, "2/3");
        assert_eq!(conditions[0].last_transition_time, old);

        let (conditions, changed) = set_status_condition(&conditions, ready("True", "AllMembersReady", "3/3"));
        assert!(changed);
        assert!(conditions[0].last_transition_time.0 - old.0 > Duration::days(1));
    }

    #[test]
    fn other_condition_types_are_untouched() {
        let mut other = ready("True", "Done", "");
        other.type_ = "Upgraded".to_string();
        let (conditions, changed) = set_status_condition(&[other], ready("False", "MembersNotReady", "0/3"));
        assert!(changed);
        assert_eq!(conditions.len(), 2);
        assert!(is_status_condition_true(&conditions, "Upgraded"));
        assert!(!is_status_condition_true(&conditions, "Ready"));
    }
}
