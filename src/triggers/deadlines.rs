//! Interaction deadline sweep.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::engine::{Executor, TransitionResult, Trigger};
use crate::error::Result;

/// Close every open interaction whose deadline passed by `now` and resume
/// its instance with the responses gathered so far. Returns how many
/// instances moved.
pub async fn expire_overdue_interactions(executor: &Executor, now: DateTime<Utc>) -> Result<usize> {
    let overdue = executor.storage().overdue_interactions(now).await?;
    let mut resumed = 0;

    for interaction in overdue {
        let trigger = Trigger::DeadlineElapsed {
            interaction_id: interaction.id.clone(),
        };
        match executor.advance(&interaction.instance_id, trigger).await {
            Ok(TransitionResult::NoOp | TransitionResult::Rejected { .. }) => {}
            Ok(result) => {
                info!(
                    interaction_id = %interaction.id,
                    instance_id = %interaction.instance_id,
                    outcome = result.outcome(),
                    "Overdue interaction expired"
                );
                resumed += 1;
            }
            Err(e) => {
                warn!(
                    interaction_id = %interaction.id,
                    instance_id = %interaction.instance_id,
                    error = %e,
                    "Failed to expire interaction"
                );
            }
        }
    }

    Ok(resumed)
}
