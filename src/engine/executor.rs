//! Step executor.
//!
//! `advance` runs one turn for an instance. It applies the trigger, then
//! walks the graph until the path ends, a suspension point is reached or a
//! step fails. Instances created during the turn (swapped-in workflows,
//! tickets bound to a workflow) run afterwards as follow-up turns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{evaluate_answers, render_operands};
use super::locks::InstanceLocks;
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::{Error, Result, StepFailure};
use crate::metrics;
use crate::smart_values::Snapshot;
use crate::storage::{
    Activity, Instance, InstanceStatus, Interaction, InteractionKind, InteractionStatus,
    SqliteStorage, StatusRef, StepStatus,
};
use crate::workflow::{DefinitionCache, Step, StepGraph, StepKind};

/// External event handed to [`Executor::advance`].
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// The instance was just created
    Created,
    /// Continue a running instance, e.g. one that yielded
    Tick,
    InteractionResponse {
        interaction_id: String,
        respondent: String,
        data: Value,
    },
    SignatureCompleted {
        interaction_id: String,
        signer: String,
    },
    /// The interaction's deadline passed
    DeadlineElapsed { interaction_id: String },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Tick => "tick",
            Self::InteractionResponse { .. } => "interaction_response",
            Self::SignatureCompleted { .. } => "signature_completed",
            Self::DeadlineElapsed { .. } => "deadline_elapsed",
        }
    }
}

/// What one `advance` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionResult {
    /// Waiting on an interaction or signatures
    Suspended {
        step_id: String,
        interaction_id: String,
    },
    Finished,
    /// A fatal step error; the instance is left in `error` for inspection
    Halted { failure: StepFailure },
    /// The instance was replaced by another one
    Swapped { new_instance_id: String },
    /// Response stored, quorum not met yet
    Recorded { responses: usize, quorum: u32 },
    /// Already applied, or nothing to do in the current state
    NoOp,
    /// Late or foreign input, e.g. a response to a superseded interaction
    Rejected { reason: String },
    /// Step limit reached; a `Tick` continues from `step_id`
    Yielded { step_id: String },
}

impl TransitionResult {
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Suspended { .. } => "suspended",
            Self::Finished => "finished",
            Self::Halted { .. } => "halted",
            Self::Swapped { .. } => "swapped",
            Self::Recorded { .. } => "recorded",
            Self::NoOp => "noop",
            Self::Rejected { .. } => "rejected",
            Self::Yielded { .. } => "yielded",
        }
    }
}

/// An instance started on behalf of a caller, with its first turn.
#[derive(Debug, Clone, Serialize)]
pub struct StartedInstance {
    pub activity_id: String,
    pub instance_id: String,
    pub result: TransitionResult,
}

/// What a step asks the executor to do next.
pub(super) enum StepOutcome {
    /// Take this edge; `None` ends the path
    Next(Option<String>),
    /// Wait on the given interaction
    Suspend(String),
    /// Hand over to the given, freshly created instance
    Swap(String),
}

/// State carried through one turn.
pub(super) struct Turn {
    pub instance: Instance,
    pub activity: Activity,
    pub vars: HashMap<String, String>,
    pub follow_ups: Vec<String>,
}

impl Turn {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::from_activity(&self.activity).with_vars(self.vars.clone())
    }
}

enum Gate {
    Open(Interaction),
    Closed(TransitionResult),
}

/// Workflow executor.
pub struct Executor {
    pub(super) storage: SqliteStorage,
    pub(super) collaborators: Collaborators,
    pub(super) cache: DefinitionCache,
    pub(super) locks: InstanceLocks,
    pub(super) config: EngineConfig,
}

impl Executor {
    /// Create a new executor with default engine settings.
    pub fn new(storage: SqliteStorage, collaborators: Collaborators) -> Self {
        let config = EngineConfig::default();
        Self {
            storage,
            collaborators,
            cache: DefinitionCache::with_capacity(config.definition_cache_capacity),
            locks: InstanceLocks::new(),
            config,
        }
    }

    /// Apply engine settings. Resets the definition cache to the configured capacity.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.cache = DefinitionCache::with_capacity(config.definition_cache_capacity);
        self.config = config;
        self
    }

    /// Share a definition cache with other executors.
    pub fn with_cache(mut self, cache: DefinitionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Share instance locks with other executors in this process.
    pub fn with_locks(mut self, locks: InstanceLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Advance an instance in response to one trigger.
    ///
    /// At most one turn per instance runs at a time. A trigger that was
    /// already applied, or that no longer matches the instance state, is
    /// reported as `NoOp` or `Rejected` without side effects.
    #[instrument(
        name = "instance.advance",
        skip(self, trigger),
        fields(instance_id = %instance_id, trigger = trigger.name())
    )]
    pub async fn advance(&self, instance_id: &str, trigger: Trigger) -> Result<TransitionResult> {
        let (result, follow_ups) = self.turn(instance_id, trigger).await?;
        metrics::record_transition(result.outcome());
        self.run_follow_ups(follow_ups).await;
        self.locks.prune().await;
        Ok(result)
    }

    /// Persist a new activity and start the workflow bound to its form, if any.
    #[instrument(
        name = "activity.open",
        skip(self, activity),
        fields(activity_id = %activity.id, form_id = %activity.form_id)
    )]
    pub async fn open_activity(&self, mut activity: Activity) -> Result<Option<StartedInstance>> {
        if activity.status.id.is_empty() {
            if let Some(status) = self.storage.initial_status().await? {
                activity.status = status;
            }
        }
        self.storage.save_activity(&activity).await?;
        info!(name = %activity.name, "Activity opened");

        let Some(instance) = self.bind_workflow(&activity).await? else {
            debug!("No published workflow bound to form");
            return Ok(None);
        };

        let result = self.advance(&instance.id, Trigger::Created).await?;
        Ok(Some(StartedInstance {
            activity_id: activity.id,
            instance_id: instance.id,
            result,
        }))
    }

    /// Start the latest published definition of `workflow_id` on an activity.
    pub async fn start_instance(
        &self,
        activity_id: &str,
        workflow_id: &str,
    ) -> Result<StartedInstance> {
        let activity = self
            .storage
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| Error::Execution(format!("Activity not found: {}", activity_id)))?;
        let definition = self
            .storage
            .latest_published(workflow_id)
            .await?
            .ok_or_else(|| {
                Error::Workflow(format!(
                    "Workflow '{}' has no published definition",
                    workflow_id
                ))
            })?;

        let instance = Instance::new(&activity.id, &definition.id);
        self.storage.create_instance(&instance).await?;
        info!(
            activity_id = %activity.id,
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            "Instance created"
        );

        let result = self.advance(&instance.id, Trigger::Created).await?;
        Ok(StartedInstance {
            activity_id: activity.id,
            instance_id: instance.id,
            result,
        })
    }

    /// Set an activity's status from outside a workflow.
    ///
    /// A terminal status supersedes every open interaction and every live
    /// instance of the activity. Returns the number of superseded
    /// interactions.
    pub async fn change_activity_status(&self, activity_id: &str, status_id: &str) -> Result<usize> {
        let mut activity = self
            .storage
            .get_activity(activity_id)
            .await?
            .ok_or_else(|| Error::Execution(format!("Activity not found: {}", activity_id)))?;
        let status = self
            .storage
            .get_status(status_id)
            .await?
            .ok_or_else(|| Error::Validation(format!("Unknown status: {}", status_id)))?;

        let terminal = status.kind.is_terminal();
        let mut superseded = self.apply_status(&mut activity, status).await?;
        if !terminal {
            return Ok(0);
        }

        for listed in self.storage.list_instances(activity_id).await? {
            if listed.finished() {
                continue;
            }
            let _guard = self.locks.acquire(&listed.id).await;
            let Some(mut instance) = self.storage.get_instance(&listed.id).await? else {
                continue;
            };
            if instance.finished() {
                continue;
            }
            instance.status = InstanceStatus::Superseded;
            instance.finished_at = Some(Utc::now());
            if !self.storage.update_instance(&mut instance).await? {
                warn!(instance_id = %instance.id, "Instance changed while superseding it");
                continue;
            }
            // A turn that raced the status change may have opened more
            superseded += self
                .storage
                .supersede_instance_interactions(&instance.id)
                .await?;
        }
        self.refresh_open_interactions().await;
        self.locks.prune().await;
        Ok(superseded)
    }

    /// Store a new status on the activity. Terminal statuses close the
    /// activity and supersede its open interactions.
    pub(super) async fn apply_status(
        &self,
        activity: &mut Activity,
        status: StatusRef,
    ) -> Result<usize> {
        let now = Utc::now();
        let terminal = status.kind.is_terminal();
        info!(
            activity_id = %activity.id,
            status = %status.name,
            kind = %status.kind,
            "Activity status changed"
        );
        activity.status = status;
        activity.updated_at = now;
        if terminal && activity.finished_at.is_none() {
            activity.finished_at = Some(now);
        }
        self.storage
            .update_activity_status(&activity.id, &activity.status)
            .await?;

        if !terminal {
            return Ok(0);
        }
        let superseded = self
            .storage
            .supersede_activity_interactions(&activity.id)
            .await?;
        if superseded > 0 {
            info!(activity_id = %activity.id, superseded, "Open interactions superseded");
        }
        self.refresh_open_interactions().await;
        Ok(superseded)
    }

    /// Create an instance of the latest published definition bound to the
    /// activity's form.
    pub(super) async fn bind_workflow(&self, activity: &Activity) -> Result<Option<Instance>> {
        let Some(workflow) = self.storage.find_workflow_for_form(&activity.form_id).await? else {
            return Ok(None);
        };
        let Some(definition) = self.storage.latest_published(&workflow.id).await? else {
            warn!(workflow_id = %workflow.id, "Workflow bound to form has no published definition");
            return Ok(None);
        };

        let instance = Instance::new(&activity.id, &definition.id);
        self.storage.create_instance(&instance).await?;
        Ok(Some(instance))
    }

    /// Persist the turn's field values. Status and `finished_at` have their
    /// own writes so a stale turn copy never overwrites them.
    pub(super) async fn save_fields(&self, activity: &mut Activity) -> Result<()> {
        activity.updated_at = Utc::now();
        self.storage
            .update_activity_fields(&activity.id, &activity.fields)
            .await?;
        Ok(())
    }

    async fn run_follow_ups(&self, initial: Vec<String>) {
        let mut queue: VecDeque<String> = initial.into();
        let mut processed = 0;

        while let Some(instance_id) = queue.pop_front() {
            if processed >= self.config.max_follow_ups {
                warn!(
                    pending = queue.len() + 1,
                    "Follow-up limit reached; remaining instances wait for a tick"
                );
                break;
            }
            processed += 1;

            match self.turn(&instance_id, Trigger::Created).await {
                Ok((result, more)) => {
                    metrics::record_transition(result.outcome());
                    debug!(instance_id = %instance_id, outcome = result.outcome(), "Follow-up turn done");
                    queue.extend(more);
                }
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "Follow-up turn failed");
                }
            }
        }
    }

    async fn turn(
        &self,
        instance_id: &str,
        trigger: Trigger,
    ) -> Result<(TransitionResult, Vec<String>)> {
        let _guard = self.locks.acquire(instance_id).await;

        let instance = self
            .storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| Error::Execution(format!("Instance not found: {}", instance_id)))?;

        if instance.finished() {
            let result = self.settled(&instance, &trigger).await?;
            return Ok((result, Vec::new()));
        }

        let activity = self
            .storage
            .get_activity(&instance.activity_id)
            .await?
            .ok_or_else(|| {
                Error::Execution(format!("Activity not found: {}", instance.activity_id))
            })?;
        let graph = self.load_graph(&instance.definition_id).await?;
        let vars = self.storage.get_variables().await?;

        let mut turn = Turn {
            instance,
            activity,
            vars,
            follow_ups: Vec::new(),
        };

        let result = match trigger {
            Trigger::Created | Trigger::Tick => self.on_tick(&graph, &mut turn).await?,
            Trigger::InteractionResponse {
                interaction_id,
                respondent,
                data,
            } => {
                self.on_response(
                    &graph,
                    &mut turn,
                    &interaction_id,
                    &respondent,
                    data,
                    InteractionKind::Interaction,
                )
                .await?
            }
            Trigger::SignatureCompleted {
                interaction_id,
                signer,
            } => {
                let data = json!({ "signed": true, "signer": signer.clone() });
                self.on_response(
                    &graph,
                    &mut turn,
                    &interaction_id,
                    &signer,
                    data,
                    InteractionKind::Signature,
                )
                .await?
            }
            Trigger::DeadlineElapsed { interaction_id } => {
                self.on_deadline(&graph, &mut turn, &interaction_id).await?
            }
        };

        Ok((result, turn.follow_ups))
    }

    /// Answer a trigger aimed at an instance that already ended. Repeats of
    /// the response that closed the interaction are no-ops, anything else
    /// is late input.
    async fn settled(&self, instance: &Instance, trigger: &Trigger) -> Result<TransitionResult> {
        let interaction_id = match trigger {
            Trigger::InteractionResponse { interaction_id, .. }
            | Trigger::SignatureCompleted { interaction_id, .. } => interaction_id,
            _ => return Ok(TransitionResult::NoOp),
        };

        let status = self
            .storage
            .get_interaction(interaction_id)
            .await?
            .map(|interaction| interaction.status);
        Ok(match status {
            Some(InteractionStatus::Satisfied | InteractionStatus::Expired) => {
                TransitionResult::NoOp
            }
            _ => TransitionResult::Rejected {
                reason: format!("instance is {}", instance.status),
            },
        })
    }

    async fn on_tick(&self, graph: &StepGraph, turn: &mut Turn) -> Result<TransitionResult> {
        if turn.instance.status != InstanceStatus::Running {
            return Ok(TransitionResult::NoOp);
        }
        if !self.storage.update_instance(&mut turn.instance).await? {
            return Ok(TransitionResult::NoOp);
        }
        let cursor = turn.instance.cursor.clone();
        self.run_from(graph, turn, cursor).await
    }

    async fn on_response(
        &self,
        graph: &StepGraph,
        turn: &mut Turn,
        interaction_id: &str,
        respondent: &str,
        data: Value,
        kind: InteractionKind,
    ) -> Result<TransitionResult> {
        let interaction = match self.gate(turn, interaction_id, Some(kind)).await? {
            Gate::Open(interaction) => interaction,
            Gate::Closed(result) => return Ok(result),
        };

        let respondent = respondent.trim().to_lowercase();
        if !interaction.recipients.is_empty()
            && !interaction
                .recipients
                .iter()
                .any(|r| r.eq_ignore_ascii_case(&respondent))
        {
            return Ok(TransitionResult::Rejected {
                reason: format!("{} is not a recipient", respondent),
            });
        }

        if !self
            .storage
            .record_response(&interaction.id, &respondent, &data)
            .await?
        {
            debug!(interaction_id = %interaction.id, respondent = %respondent, "Duplicate response ignored");
            return Ok(TransitionResult::NoOp);
        }

        let responses = self.storage.list_responses(&interaction.id).await?.len();
        if responses < interaction.quorum as usize {
            info!(
                interaction_id = %interaction.id,
                responses,
                quorum = interaction.quorum,
                "Response recorded; waiting for quorum"
            );
            return Ok(TransitionResult::Recorded {
                responses,
                quorum: interaction.quorum,
            });
        }

        if !self
            .storage
            .close_interaction(&interaction.id, InteractionStatus::Satisfied)
            .await?
        {
            return Ok(TransitionResult::NoOp);
        }
        self.resume(graph, turn, &interaction).await
    }

    async fn on_deadline(
        &self,
        graph: &StepGraph,
        turn: &mut Turn,
        interaction_id: &str,
    ) -> Result<TransitionResult> {
        let interaction = match self.gate(turn, interaction_id, None).await? {
            Gate::Open(interaction) => interaction,
            Gate::Closed(result) => return Ok(result),
        };
        if !self
            .storage
            .close_interaction(&interaction.id, InteractionStatus::Expired)
            .await?
        {
            return Ok(TransitionResult::NoOp);
        }
        info!(interaction_id = %interaction.id, "Interaction deadline elapsed; resuming with gathered responses");
        self.resume(graph, turn, &interaction).await
    }

    /// Check that an interaction may still move the instance.
    async fn gate(
        &self,
        turn: &Turn,
        interaction_id: &str,
        kind: Option<InteractionKind>,
    ) -> Result<Gate> {
        let Some(interaction) = self.storage.get_interaction(interaction_id).await? else {
            return Ok(Gate::Closed(TransitionResult::Rejected {
                reason: format!("unknown interaction {}", interaction_id),
            }));
        };

        if interaction.instance_id != turn.instance.id
            || kind.is_some_and(|k| k != interaction.kind)
        {
            return Ok(Gate::Closed(TransitionResult::Rejected {
                reason: "interaction does not belong to this instance".to_string(),
            }));
        }

        match interaction.status {
            InteractionStatus::Open => {}
            InteractionStatus::Superseded => {
                return Ok(Gate::Closed(TransitionResult::Rejected {
                    reason: "interaction was superseded".to_string(),
                }))
            }
            InteractionStatus::Satisfied | InteractionStatus::Expired => {
                return Ok(Gate::Closed(TransitionResult::NoOp))
            }
        }

        if turn.instance.status != InstanceStatus::Waiting
            || turn.instance.cursor.as_deref() != Some(interaction.step_id.as_str())
        {
            return Ok(Gate::Closed(TransitionResult::NoOp));
        }
        Ok(Gate::Open(interaction))
    }

    /// Leave a suspension point once its interaction is closed.
    async fn resume(
        &self,
        graph: &StepGraph,
        turn: &mut Turn,
        interaction: &Interaction,
    ) -> Result<TransitionResult> {
        turn.instance.status = InstanceStatus::Running;
        if !self.storage.update_instance(&mut turn.instance).await? {
            return Ok(TransitionResult::NoOp);
        }

        let record = self
            .storage
            .latest_step_record(&turn.instance.id, &interaction.step_id)
            .await?;
        let record_id = record.as_ref().map(|r| r.id.as_str());

        let Some(step) = graph.step(&interaction.step_id) else {
            let err = Error::Workflow(format!("Step '{}' not found", interaction.step_id));
            return self.halt(turn, &interaction.step_id, record_id, err).await;
        };

        let next = match self.edge_after_wait(step, turn, interaction).await {
            Ok(next) => next,
            Err(err) => return self.halt(turn, &step.id, record_id, err).await,
        };

        if let Some(record_id) = record_id {
            self.storage
                .update_step_status(record_id, StepStatus::Finished, None)
                .await?;
        }
        metrics::record_step_execution(step.kind.name(), "finished");
        self.refresh_open_interactions().await;
        self.run_from(graph, turn, next).await
    }

    /// Interaction steps with conditions branch on the collected answers.
    async fn edge_after_wait(
        &self,
        step: &Step,
        turn: &Turn,
        interaction: &Interaction,
    ) -> Result<Option<String>> {
        let StepKind::Interaction(payload) = &step.kind else {
            return Ok(step.next.default.clone());
        };
        if payload.conditions.is_empty() {
            return Ok(step.next.default.clone());
        }

        let answers: Vec<Map<String, Value>> = self
            .storage
            .list_responses(&interaction.id)
            .await?
            .into_iter()
            .filter_map(|response| match response.data {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        let conditions = render_operands(&payload.conditions, &turn.snapshot());
        let evaluation = evaluate_answers(&conditions, payload.match_mode, &answers)?;

        Ok(if evaluation.passed {
            step.next.default.clone()
        } else {
            step.next.alternative.clone()
        })
    }

    /// Execute steps from `start` until the path ends, a step suspends or
    /// fails, or the per-turn step limit is hit.
    async fn run_from(
        &self,
        graph: &StepGraph,
        turn: &mut Turn,
        start: Option<String>,
    ) -> Result<TransitionResult> {
        let mut cursor = start;
        let mut executed = 0usize;

        loop {
            let Some(step_id) = cursor.take() else {
                return self.finish(turn).await;
            };

            if executed >= self.config.max_steps_per_turn {
                turn.instance.cursor = Some(step_id.clone());
                turn.instance.status = InstanceStatus::Running;
                self.save_instance(&mut turn.instance).await?;
                warn!(step_id = %step_id, executed, "Step limit reached; instance yields");
                return Ok(TransitionResult::Yielded { step_id });
            }
            executed += 1;

            let Some(step) = graph.step(&step_id) else {
                let err = Error::Workflow(format!(
                    "Step '{}' not found in definition {}",
                    step_id,
                    graph.definition().id
                ));
                return self.halt(turn, &step_id, None, err).await;
            };

            turn.instance.cursor = Some(step.id.clone());
            let record = self
                .storage
                .start_step(&turn.instance.id, &step.id, StepStatus::InProgress)
                .await?;
            let kind = step.kind.name();
            let started = Instant::now();
            let outcome = self.execute_step(step, turn).await;
            metrics::record_step_duration(started.elapsed(), kind);

            match outcome {
                Ok(StepOutcome::Next(next)) => {
                    self.storage
                        .update_step_status(&record.id, StepStatus::Finished, None)
                        .await?;
                    metrics::record_step_execution(kind, "finished");
                    debug!(step_id = %step.id, kind, next = ?next, "Step finished");
                    cursor = next;
                }
                Ok(StepOutcome::Suspend(interaction_id)) => {
                    self.storage
                        .update_step_status(&record.id, StepStatus::InQueue, None)
                        .await?;
                    metrics::record_step_execution(kind, "in_queue");
                    turn.instance.status = InstanceStatus::Waiting;
                    self.save_instance(&mut turn.instance).await?;
                    self.refresh_open_interactions().await;
                    info!(step_id = %step.id, interaction_id = %interaction_id, "Instance waiting");
                    return Ok(TransitionResult::Suspended {
                        step_id: step.id.clone(),
                        interaction_id,
                    });
                }
                Ok(StepOutcome::Swap(new_instance_id)) => {
                    self.storage
                        .update_step_status(&record.id, StepStatus::Finished, None)
                        .await?;
                    metrics::record_step_execution(kind, "finished");
                    turn.instance.status = InstanceStatus::Superseded;
                    turn.instance.cursor = None;
                    turn.instance.finished_at = Some(Utc::now());
                    self.save_instance(&mut turn.instance).await?;
                    self.storage
                        .supersede_instance_interactions(&turn.instance.id)
                        .await?;
                    info!(new_instance_id = %new_instance_id, "Instance superseded by swapped workflow");
                    turn.follow_ups.push(new_instance_id.clone());
                    return Ok(TransitionResult::Swapped { new_instance_id });
                }
                Err(err) => {
                    metrics::record_step_execution(kind, "error");
                    return self.halt(turn, &step.id, Some(&record.id), err).await;
                }
            }
        }
    }

    async fn finish(&self, turn: &mut Turn) -> Result<TransitionResult> {
        let now = Utc::now();
        turn.instance.status = InstanceStatus::Finished;
        turn.instance.cursor = None;
        turn.instance.finished_at = Some(now);
        self.save_instance(&mut turn.instance).await?;
        self.storage
            .supersede_instance_interactions(&turn.instance.id)
            .await?;

        turn.activity.finished_at = Some(now);
        self.storage
            .mark_activity_finished(&turn.activity.id, now)
            .await?;

        info!(
            instance_id = %turn.instance.id,
            activity_id = %turn.activity.id,
            "Instance finished"
        );
        Ok(TransitionResult::Finished)
    }

    /// Mark the step and instance `error`. Nothing is retried.
    async fn halt(
        &self,
        turn: &mut Turn,
        step_id: &str,
        record_id: Option<&str>,
        err: Error,
    ) -> Result<TransitionResult> {
        let failure = StepFailure::new(step_id, &err);
        error!(
            instance_id = %turn.instance.id,
            step_id,
            code = err.code(),
            error = %err,
            "Step failed; instance halted"
        );

        if let Some(record_id) = record_id {
            self.storage
                .update_step_status(record_id, StepStatus::Error, Some(&failure.message))
                .await?;
        }

        turn.instance.status = InstanceStatus::Error;
        turn.instance.cursor = Some(step_id.to_string());
        turn.instance.error = Some(failure.to_string());
        turn.instance.finished_at = Some(Utc::now());
        self.save_instance(&mut turn.instance).await?;
        self.storage
            .supersede_instance_interactions(&turn.instance.id)
            .await?;
        self.refresh_open_interactions().await;

        Ok(TransitionResult::Halted { failure })
    }

    async fn save_instance(&self, instance: &mut Instance) -> Result<()> {
        if self.storage.update_instance(instance).await? {
            Ok(())
        } else {
            Err(Error::Execution(format!(
                "Instance {} was modified concurrently",
                instance.id
            )))
        }
    }

    async fn load_graph(&self, definition_id: &str) -> Result<Arc<StepGraph>> {
        if let Some(graph) = self.cache.get(definition_id).await {
            return Ok(graph);
        }
        let definition = self
            .storage
            .get_definition(definition_id)
            .await?
            .ok_or_else(|| Error::Workflow(format!("Definition not found: {}", definition_id)))?;

        let graph = Arc::new(StepGraph::new(definition));
        self.cache.insert(graph.clone()).await;
        Ok(graph)
    }

    async fn refresh_open_interactions(&self) {
        match self.storage.count_open_interactions().await {
            Ok(count) => metrics::set_open_interactions(count),
            Err(e) => debug!(error = %e, "Could not count open interactions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        EmailDispatcher, HttpClient, HttpRequest, HttpResponse, RhaiScriptEvaluator,
        SignatureProvider, SignatureRequest,
    };
    use crate::storage::{ActivityUser, StatusKind, StoredWorkflow};
    use crate::workflow::parse_definition;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingEmail {
        sent: StdMutex<Vec<(Vec<String>, String, String)>>,
    }

    #[async_trait]
    impl EmailDispatcher for RecordingEmail {
        async fn send(&self, recipients: &[String], subject: &str, body: &str) -> Result<()> {
            self.sent.lock().unwrap().push((
                recipients.to_vec(),
                subject.to_string(),
                body.to_string(),
            ));
            Ok(())
        }
    }

    /// Answers every request with `body` after `delay`, or fails.
    struct ScriptedHttp {
        delay: Duration,
        body: Value,
        fail: bool,
        calls: StdMutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn ok(body: Value) -> Self {
            Self {
                delay: Duration::ZERO,
                body,
                fail: false,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::ok(Value::Null)
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok(Value::Null)
            }
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.calls.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Step("HTTP 500".to_string()));
            }
            Ok(HttpResponse {
                status: 200,
                body: self.body.clone(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSignatures {
        requests: StdMutex<Vec<SignatureRequest>>,
    }

    #[async_trait]
    impl SignatureProvider for RecordingSignatures {
        async fn request_signatures(&self, request: &SignatureRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            Ok("env-1".to_string())
        }
    }

    struct Harness {
        executor: Executor,
        storage: SqliteStorage,
        email: Arc<RecordingEmail>,
        http: Arc<ScriptedHttp>,
        signatures: Arc<RecordingSignatures>,
    }

    async fn harness_with(http: ScriptedHttp, config: EngineConfig) -> Harness {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .save_status(&StatusRef::new("st-open", "Open", StatusKind::Progress))
            .await
            .unwrap();
        storage
            .save_status(&StatusRef::new("st-done", "Done", StatusKind::Done))
            .await
            .unwrap();

        let email = Arc::new(RecordingEmail::default());
        let http = Arc::new(http);
        let signatures = Arc::new(RecordingSignatures::default());
        let collaborators = Collaborators {
            email: email.clone(),
            http: http.clone(),
            scripts: Arc::new(RhaiScriptEvaluator::new()),
            signatures: signatures.clone(),
        };
        let executor = Executor::new(storage.clone(), collaborators).with_config(config);

        Harness {
            executor,
            storage,
            email,
            http,
            signatures,
        }
    }

    async fn harness() -> Harness {
        harness_with(ScriptedHttp::ok(Value::Null), EngineConfig::default()).await
    }

    async fn publish(storage: &SqliteStorage, workflow_id: &str, form_id: Option<&str>, yaml: &str) {
        storage
            .save_workflow(&StoredWorkflow {
                id: workflow_id.to_string(),
                name: workflow_id.to_string(),
                form_id: form_id.map(str::to_string),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let parsed = parse_definition(yaml).unwrap();
        let draft = storage.create_draft(workflow_id, &parsed.steps).await.unwrap();
        storage.publish_definition(&draft.id).await.unwrap();
    }

    async fn activity(storage: &SqliteStorage, fields: Value) -> Activity {
        let mut activity = Activity::new(
            "form-a",
            "Request",
            StatusRef::new("st-open", "Open", StatusKind::Progress),
        );
        activity.users = vec![
            ActivityUser::new("u1", "Ana", "ana@example.com"),
            ActivityUser::new("u2", "Bruno", "bruno@example.com"),
        ];
        for (id, value) in fields.as_object().unwrap() {
            activity.upsert_field(id, value.clone());
        }
        storage.save_activity(&activity).await.unwrap();
        activity
    }

    async fn field(storage: &SqliteStorage, activity_id: &str, id: &str) -> Option<Value> {
        let activity = storage.get_activity(activity_id).await.unwrap().unwrap();
        activity.field_map().get(id).cloned()
    }

    fn respond(interaction_id: &str, respondent: &str, data: Value) -> Trigger {
        Trigger::InteractionResponse {
            interaction_id: interaction_id.to_string(),
            respondent: respondent.to_string(),
            data,
        }
    }

    fn suspended_on(result: &TransitionResult) -> String {
        match result {
            TransitionResult::Suspended { interaction_id, .. } => interaction_id.clone(),
            other => panic!("expected suspension, got {:?}", other),
        }
    }

    const AGE_BRANCH: &str = r#"
- id: start
  kind: start
  next: { default: check }
- id: check
  kind: conditional
  payload:
    form_id: form-a
    conditions:
      - { field: age, operator: ">", value: "18" }
    ifNotExists: unknown
  next: { default: adult, alternative: minor }
- id: adult
  kind: script
  payload: { script: '#{ route: "adult" }' }
- id: minor
  kind: script
  payload: { script: '#{ route: "minor" }' }
- id: unknown
  kind: script
  payload: { script: '#{ route: "unknown" }' }
"#;

    const TWO_REVIEWERS: &str = r#"
- id: start
  kind: start
  next: { default: review }
- id: review
  kind: interaction
  payload:
    form_id: form-review
    to: [users]
    wait_for_one: false
    due_in_hours: 24
  next: { default: done }
- id: done
  kind: script
  payload: { script: '#{ reviewed: true }' }
"#;

    #[tokio::test]
    async fn test_conditional_takes_default_or_alternative() {
        let h = harness().await;
        publish(&h.storage, "wf", None, AGE_BRANCH).await;

        let adult = activity(&h.storage, json!({"age": 20})).await;
        let started = h.executor.start_instance(&adult.id, "wf").await.unwrap();
        assert_eq!(started.result, TransitionResult::Finished);
        assert_eq!(field(&h.storage, &adult.id, "route").await, Some(json!("adult")));

        let minor = activity(&h.storage, json!({"age": 10})).await;
        h.executor.start_instance(&minor.id, "wf").await.unwrap();
        assert_eq!(field(&h.storage, &minor.id, "route").await, Some(json!("minor")));
    }

    #[tokio::test]
    async fn test_conditional_missing_field_uses_if_not_exists() {
        let h = harness().await;
        publish(&h.storage, "wf", None, AGE_BRANCH).await;

        let activity = activity(&h.storage, json!({"name_only": "x"})).await;
        h.executor.start_instance(&activity.id, "wf").await.unwrap();
        assert_eq!(field(&h.storage, &activity.id, "route").await, Some(json!("unknown")));
    }

    #[tokio::test]
    async fn test_finished_path_closes_activity() {
        let h = harness().await;
        publish(&h.storage, "wf", None, AGE_BRANCH).await;

        let activity = activity(&h.storage, json!({"age": 30})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();

        let instance = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Finished);
        assert!(instance.cursor.is_none());
        let stored = h.storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert!(stored.finished_at.is_some());

        let steps: Vec<String> = h
            .storage
            .list_step_records(&instance.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.step_id)
            .collect();
        assert_eq!(steps, vec!["start", "check", "adult"]);
    }

    #[tokio::test]
    async fn test_wait_all_stays_in_queue_until_quorum() {
        let h = harness().await;
        publish(&h.storage, "wf", None, TWO_REVIEWERS).await;
        let activity = activity(&h.storage, json!({})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);
        let interaction = h.storage.get_interaction(&interaction_id).await.unwrap().unwrap();
        assert_eq!(interaction.quorum, 2);
        assert!(interaction.due_at.is_some());

        let first = h
            .executor
            .advance(&started.instance_id, respond(&interaction_id, "ana@example.com", json!({})))
            .await
            .unwrap();
        assert_eq!(first, TransitionResult::Recorded { responses: 1, quorum: 2 });

        let record = h
            .storage
            .latest_step_record(&started.instance_id, "review")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::InQueue);
        let instance = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Waiting);

        let second = h
            .executor
            .advance(&started.instance_id, respond(&interaction_id, "Bruno@Example.com", json!({})))
            .await
            .unwrap();
        assert_eq!(second, TransitionResult::Finished);

        let record = h
            .storage
            .latest_step_record(&started.instance_id, "review")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::Finished);
        assert_eq!(field(&h.storage, &activity.id, "reviewed").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_repeated_response_applies_once() {
        let h = harness().await;
        publish(&h.storage, "wf", None, TWO_REVIEWERS).await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);
        let id = &started.instance_id;

        let ana = respond(&interaction_id, "ana@example.com", json!({"ok": 1}));
        h.executor.advance(id, ana.clone()).await.unwrap();
        assert_eq!(h.executor.advance(id, ana).await.unwrap(), TransitionResult::NoOp);

        let bruno = respond(&interaction_id, "bruno@example.com", json!({}));
        assert_eq!(
            h.executor.advance(id, bruno.clone()).await.unwrap(),
            TransitionResult::Finished
        );
        assert_eq!(h.executor.advance(id, bruno).await.unwrap(), TransitionResult::NoOp);

        let done_visits = h
            .storage
            .list_step_records(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.step_id == "done")
            .count();
        assert_eq!(done_visits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_responses_advance_once() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            &TWO_REVIEWERS.replace("wait_for_one: false", "wait_for_one: true"),
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        let executor = Arc::new(h.executor);
        let mut handles = Vec::new();
        for respondent in ["ana@example.com", "bruno@example.com"] {
            let executor = executor.clone();
            let instance_id = started.instance_id.clone();
            let trigger = respond(&interaction_id, respondent, json!({}));
            handles.push(tokio::spawn(async move {
                executor.advance(&instance_id, trigger).await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        let finished = results
            .iter()
            .filter(|r| **r == TransitionResult::Finished)
            .count();
        assert_eq!(finished, 1);
        assert!(results.contains(&TransitionResult::NoOp));
    }

    #[tokio::test]
    async fn test_stranger_cannot_respond() {
        let h = harness().await;
        publish(&h.storage, "wf", None, TWO_REVIEWERS).await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        let result = h
            .executor
            .advance(&started.instance_id, respond(&interaction_id, "eve@example.com", json!({})))
            .await
            .unwrap();
        assert!(matches!(result, TransitionResult::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_interaction_conditions_pick_alternative() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: approval
  kind: interaction
  payload:
    form_id: form-approval
    to: ["{{activity.users.0.email}}"]
    waitForOne: true
    conditions:
      - { field: approved, operator: "==", value: true }
  next: { default: approved, alternative: rejected }
- id: approved
  kind: script
  payload: { script: '#{ outcome: "approved" }' }
- id: rejected
  kind: script
  payload: { script: '#{ outcome: "rejected" }' }
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        h.executor
            .advance(
                &started.instance_id,
                respond(&interaction_id, "ana@example.com", json!({"approved": false})),
            )
            .await
            .unwrap();
        assert_eq!(field(&h.storage, &activity.id, "outcome").await, Some(json!("rejected")));
    }

    #[tokio::test]
    async fn test_deadline_resumes_with_gathered_responses() {
        let h = harness().await;
        publish(&h.storage, "wf", None, TWO_REVIEWERS).await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        let result = h
            .executor
            .advance(
                &started.instance_id,
                Trigger::DeadlineElapsed {
                    interaction_id: interaction_id.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result, TransitionResult::Finished);

        let interaction = h.storage.get_interaction(&interaction_id).await.unwrap().unwrap();
        assert_eq!(interaction.status, InteractionStatus::Expired);
    }

    #[tokio::test]
    async fn test_script_timeout_halts_instance() {
        let config = EngineConfig {
            script_budget_ms: 50,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedHttp::ok(Value::Null), config).await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: spin
  kind: script
  payload: { script: "loop { }" }
  next: { default: after }
- id: after
  kind: script
  payload: { script: '#{ reached: true }' }
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        match &started.result {
            TransitionResult::Halted { failure } => {
                assert_eq!(failure.step_id, "spin");
                assert_eq!(failure.code, "TIMEOUT");
            }
            other => panic!("expected halt, got {:?}", other),
        }

        let instance = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Error);
        assert_eq!(instance.cursor.as_deref(), Some("spin"));
        let record = h
            .storage
            .latest_step_record(&instance.id, "spin")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, StepStatus::Error);
        assert_eq!(field(&h.storage, &activity.id, "reached").await, None);

        let retry = h.executor.advance(&instance.id, Trigger::Tick).await.unwrap();
        assert_eq!(retry, TransitionResult::NoOp);
    }

    #[tokio::test]
    async fn test_script_result_populates_fields() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: score
  kind: script
  payload: { script: '#{ score: activity.age * 2, region: vars.REGION }' }
"#,
        )
        .await;
        h.storage.set_variable("REGION", "north").await.unwrap();
        let activity = activity(&h.storage, json!({"age": 20})).await;

        h.executor.start_instance(&activity.id, "wf").await.unwrap();
        assert_eq!(field(&h.storage, &activity.id, "score").await, Some(json!(40)));
        assert_eq!(field(&h.storage, &activity.id, "region").await, Some(json!("north")));
    }

    const SYNC_CALL: &str = r#"
- id: call
  kind: web_request
  payload:
    url: "https://api.example.com/people/{{activity.age}}"
    method: GET
    timeout_seconds: 1
    field_populate:
      - { key: external_id, value: response.data.id }
  next: { default: after }
- id: after
  kind: script
  payload: { script: '#{ reached: true }' }
"#;

    #[tokio::test]
    async fn test_sync_web_request_populates_fields() {
        let http = ScriptedHttp::ok(json!({"data": {"id": "ext-9"}}));
        let h = harness_with(http, EngineConfig::default()).await;
        publish(&h.storage, "wf", None, SYNC_CALL).await;
        let activity = activity(&h.storage, json!({"age": 33})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        assert_eq!(started.result, TransitionResult::Finished);
        assert_eq!(
            field(&h.storage, &activity.id, "external_id").await,
            Some(json!("ext-9"))
        );
        let calls = h.http.calls.lock().unwrap();
        assert_eq!(calls[0].url, "https://api.example.com/people/33");
    }

    #[tokio::test]
    async fn test_sync_web_request_timeout_halts() {
        let h = harness_with(ScriptedHttp::slow(Duration::from_secs(5)), EngineConfig::default()).await;
        publish(&h.storage, "wf", None, SYNC_CALL).await;
        let activity = activity(&h.storage, json!({"age": 1})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        match &started.result {
            TransitionResult::Halted { failure } => assert_eq!(failure.code, "TIMEOUT"),
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(field(&h.storage, &activity.id, "reached").await, None);
    }

    #[tokio::test]
    async fn test_sync_web_request_failure_halts() {
        let h = harness_with(ScriptedHttp::failing(), EngineConfig::default()).await;
        publish(&h.storage, "wf", None, SYNC_CALL).await;
        let activity = activity(&h.storage, json!({"age": 1})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        assert!(matches!(started.result, TransitionResult::Halted { .. }));
    }

    #[tokio::test]
    async fn test_async_web_request_does_not_wait() {
        let h = harness_with(ScriptedHttp::slow(Duration::from_secs(5)), EngineConfig::default()).await;
        publish(
            &h.storage,
            "wf",
            None,
            &SYNC_CALL.replace("method: GET", "method: POST\n    is_async: true"),
        )
        .await;
        let activity = activity(&h.storage, json!({"age": 1})).await;

        let started = tokio::time::timeout(
            Duration::from_secs(2),
            h.executor.start_instance(&activity.id, "wf"),
        )
        .await
        .expect("async request must not block the turn")
        .unwrap();
        assert_eq!(started.result, TransitionResult::Finished);
        assert_eq!(field(&h.storage, &activity.id, "reached").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_terminal_status_survives_running_turn() {
        let h = harness_with(ScriptedHttp::slow(Duration::from_millis(800)), EngineConfig::default()).await;
        publish(&h.storage, "wf", None, SYNC_CALL).await;
        let activity = activity(&h.storage, json!({"age": 1})).await;

        let close = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            h.executor
                .change_activity_status(&activity.id, "st-done")
                .await
                .unwrap()
        };
        let (started, _) = tokio::join!(h.executor.start_instance(&activity.id, "wf"), close);
        assert_eq!(started.unwrap().result, TransitionResult::Finished);

        let stored = h.storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.status.id, "st-done");
        assert!(stored.finished_at.is_some());
        // Fields written by the turn after the status change are kept too
        assert_eq!(stored.field_map().get("reached"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_terminal_status_supersedes_interaction_opened_by_racing_turn() {
        let h = harness_with(ScriptedHttp::slow(Duration::from_millis(800)), EngineConfig::default()).await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: call
  kind: web_request
  payload:
    url: "https://api.example.com/people"
    method: GET
    timeout_seconds: 1
  next: { default: review }
- id: review
  kind: interaction
  payload:
    form_id: form-review
    to: [users]
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;

        let close = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            h.executor
                .change_activity_status(&activity.id, "st-done")
                .await
                .unwrap()
        };
        let (started, superseded) =
            tokio::join!(h.executor.start_instance(&activity.id, "wf"), close);
        let started = started.unwrap();
        let interaction_id = suspended_on(&started.result);
        assert_eq!(superseded, 1);

        let instance = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Superseded);
        assert!(h.storage.list_open_interactions(&activity.id).await.unwrap().is_empty());

        let late = h
            .executor
            .advance(
                &started.instance_id,
                respond(&interaction_id, "ana@example.com", json!({})),
            )
            .await
            .unwrap();
        assert!(matches!(late, TransitionResult::Rejected { .. }));
        let stored = h.storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.status.id, "st-done");
    }

    #[tokio::test]
    async fn test_send_email_renders_templates() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: greet
  kind: send_email
  payload:
    to: [users]
    subject: "Hello ${{activity.name}}"
    body: "Team: ${{activity.#users.name}}"
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;
        h.executor.start_instance(&activity.id, "wf").await.unwrap();

        let sent = h.email.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["ana@example.com", "bruno@example.com"]);
        assert_eq!(sent[0].1, "Hello Request");
        assert_eq!(sent[0].2, "Team: Ana, Bruno");
    }

    #[tokio::test]
    async fn test_swap_supersedes_current_instance() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf-b",
            None,
            r#"
- id: mark
  kind: script
  payload: { script: '#{ swapped: true }' }
"#,
        )
        .await;
        publish(
            &h.storage,
            "wf-a",
            None,
            r#"
- id: swap
  kind: swap_workflow
  payload: { workflow_id: wf-b }
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;

        let started = h.executor.start_instance(&activity.id, "wf-a").await.unwrap();
        let new_instance_id = match &started.result {
            TransitionResult::Swapped { new_instance_id } => new_instance_id.clone(),
            other => panic!("expected swap, got {:?}", other),
        };

        let old = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(old.status, InstanceStatus::Superseded);
        let new = h.storage.get_instance(&new_instance_id).await.unwrap().unwrap();
        assert_eq!(new.status, InstanceStatus::Finished);
        assert_eq!(field(&h.storage, &activity.id, "swapped").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_terminal_status_supersedes_interactions() {
        let h = harness().await;
        publish(&h.storage, "wf", None, TWO_REVIEWERS).await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        let superseded = h
            .executor
            .change_activity_status(&activity.id, "st-done")
            .await
            .unwrap();
        assert_eq!(superseded, 1);

        let interaction = h.storage.get_interaction(&interaction_id).await.unwrap().unwrap();
        assert_eq!(interaction.status, InteractionStatus::Superseded);
        let instance = h.storage.get_instance(&started.instance_id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Superseded);

        let late = h
            .executor
            .advance(&started.instance_id, respond(&interaction_id, "ana@example.com", json!({})))
            .await
            .unwrap();
        assert!(matches!(late, TransitionResult::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_change_status_step_notifies_users() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: close
  kind: change_status
  payload:
    status_id: st-done
    subject: "${{activity.name}} is ${{activity.status.name}}"
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;
        h.executor.start_instance(&activity.id, "wf").await.unwrap();

        let stored = h.storage.get_activity(&activity.id).await.unwrap().unwrap();
        assert_eq!(stored.status.id, "st-done");
        let sent = h.email.sent.lock().unwrap();
        assert_eq!(sent[0].1, "Request is Done");
    }

    #[tokio::test]
    async fn test_new_ticket_starts_bound_workflow() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf-child",
            Some("form-b"),
            r#"
- id: handle
  kind: script
  payload: { script: '#{ handled: true }' }
"#,
        )
        .await;
        publish(
            &h.storage,
            "wf-main",
            None,
            r#"
- id: ticket
  kind: new_ticket
  payload:
    form_id: form-b
    name: "Follow-up for ${{activity.name}}"
    fields: { origin: "${{activity.name}}" }
"#,
        )
        .await;
        let parent = activity(&h.storage, json!({})).await;

        h.executor.start_instance(&parent.id, "wf-main").await.unwrap();

        let children = h.storage.list_child_activities(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        let child = &children[0];
        assert_eq!(child.name, "Follow-up for Request");
        assert_eq!(child.users.len(), 2);
        assert_eq!(field(&h.storage, &child.id, "origin").await, Some(json!("Request")));
        assert_eq!(field(&h.storage, &child.id, "handled").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_e_sign_waits_for_every_signer() {
        let h = harness().await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: sign
  kind: e_sign
  payload:
    document_key: "contract-${{activity.name}}"
    signers:
      - { name: "${{activity.users.0.name}}", email: "${{activity.users.0.email}}" }
      - { name: Bruno, email: bruno@example.com, role: witness }
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;
        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        let interaction_id = suspended_on(&started.result);

        {
            let requests = h.signatures.requests.lock().unwrap();
            assert_eq!(requests[0].reference, interaction_id);
            assert_eq!(requests[0].document_key, "contract-Request");
            assert_eq!(requests[0].signers[0].name, "Ana");
        }
        let interaction = h.storage.get_interaction(&interaction_id).await.unwrap().unwrap();
        assert_eq!(interaction.envelope_id.as_deref(), Some("env-1"));

        let signed = |signer: &str| Trigger::SignatureCompleted {
            interaction_id: interaction_id.clone(),
            signer: signer.to_string(),
        };
        let first = h
            .executor
            .advance(&started.instance_id, signed("ana@example.com"))
            .await
            .unwrap();
        assert_eq!(first, TransitionResult::Recorded { responses: 1, quorum: 2 });
        let second = h
            .executor
            .advance(&started.instance_id, signed("bruno@example.com"))
            .await
            .unwrap();
        assert_eq!(second, TransitionResult::Finished);
    }

    #[tokio::test]
    async fn test_step_limit_yields_and_tick_continues() {
        let config = EngineConfig {
            max_steps_per_turn: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(ScriptedHttp::ok(Value::Null), config).await;
        publish(
            &h.storage,
            "wf",
            None,
            r#"
- id: one
  kind: script
  payload: { script: "1" }
  next: { default: two }
- id: two
  kind: script
  payload: { script: "2" }
"#,
        )
        .await;
        let activity = activity(&h.storage, json!({})).await;

        let started = h.executor.start_instance(&activity.id, "wf").await.unwrap();
        assert_eq!(
            started.result,
            TransitionResult::Yielded {
                step_id: "two".to_string()
            }
        );
        let resumed = h
            .executor
            .advance(&started.instance_id, Trigger::Tick)
            .await
            .unwrap();
        assert_eq!(resumed, TransitionResult::Finished);
    }

    #[tokio::test]
    async fn test_open_activity_starts_bound_workflow() {
        let h = harness().await;
        publish(&h.storage, "wf", Some("form-a"), AGE_BRANCH).await;

        let mut activity = Activity::new("form-a", "Walk-in", StatusRef::default());
        activity.upsert_field("age", json!(44));
        let activity_id = activity.id.clone();

        let started = h.executor.open_activity(activity).await.unwrap().unwrap();
        assert_eq!(started.activity_id, activity_id);
        assert_eq!(started.result, TransitionResult::Finished);

        let stored = h.storage.get_activity(&activity_id).await.unwrap().unwrap();
        assert_eq!(stored.status.id, "st-open");
        assert_eq!(field(&h.storage, &activity_id, "route").await, Some(json!("adult")));
    }

    #[tokio::test]
    async fn test_open_activity_without_workflow() {
        let h = harness().await;
        let activity = Activity::new("form-z", "Loose", StatusRef::default());
        assert!(h.executor.open_activity(activity).await.unwrap().is_none());
    }
}
