//! Interaction wait policy.

use crate::workflow::{InteractionPayload, WaitType};

/// Number of responses an interaction needs before the instance resumes.
///
/// `any` needs one, `all` needs every recipient, `custom` needs
/// `wait_value` capped at the recipient count. Without a `wait_type` the
/// legacy `wait_for_one` flag picks between `any` and `all`.
pub fn quorum(payload: &InteractionPayload, recipients: usize) -> u32 {
    let recipients = recipients.max(1) as u32;
    let wait_type = payload.wait_type.unwrap_or(if payload.wait_for_one {
        WaitType::Any
    } else {
        WaitType::All
    });

    match wait_type {
        WaitType::Any => 1,
        WaitType::All => recipients,
        WaitType::Custom => payload.wait_value.unwrap_or(1).clamp(1, recipients),
    }
}
