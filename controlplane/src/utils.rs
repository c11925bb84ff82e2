use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

use crate::traits::HasConditions;

// Sets a condition of the given type on any object implementing HasConditions.
//
// Nothing is changed when a condition of that type already carries the same
// status, reason and message, so an unchanged object stays byte-identical and
// no status write is triggered. The transition time only moves when the
// status flips. Returns whether the conditions were modified.
pub fn set_condition<T: HasConditions>(
    obj: &mut T,
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    observed_generation: Option<i64>,
) -> bool {
    let status = if status { "True" } else { "False" }.to_string();
    let conditions = obj.get_conditions_mut();

    if let Some(condition) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if condition.status == status && condition.reason == reason && condition.message == message {
            return false;
        }
        if condition.status != status {
            condition.last_transition_time = metav1::Time(Utc::now());
        }
        condition.status = status;
        condition.reason = reason.to_string();
        condition.message = message;
        condition.observed_generation = observed_generation;
        return true;
    }

    conditions.push(metav1::Condition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message,
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    });
    true
}

pub fn find_condition<'a>(conditions: &'a [metav1::Condition], type_: &str) -> Option<&'a metav1::Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
