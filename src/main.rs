use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

use streamline::collaborators::Collaborators;
use streamline::config::Config;
use streamline::engine::{Executor, Trigger};
use streamline::recurrence::{self, Descriptor, Unit};
use streamline::shutdown::ShutdownCoordinator;
use streamline::smart_values::{resolve, Snapshot};
use streamline::storage::{
    Activity, ActivityUser, ScheduleDefinition, SqliteStorage, StatusKind, StatusRef,
    StoredWorkflow,
};
use streamline::triggers::{create_schedule, Scheduler};
use streamline::workflow::{parse_definition_file, validate_definition};
use streamline::{metrics, telemetry};

#[derive(Parser)]
#[command(name = "streamline")]
#[command(about = "Activity workflow automation engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/streamline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage workflow definitions
    Definitions {
        #[command(subcommand)]
        action: DefinitionActions,
    },
    /// Manage activities
    Activities {
        #[command(subcommand)]
        action: ActivityActions,
    },
    /// Manage activity statuses
    Statuses {
        #[command(subcommand)]
        action: StatusActions,
    },
    /// Continue a running instance (e.g. one that yielded)
    Advance {
        /// Instance ID
        instance_id: String,
    },
    /// Answer an open interaction
    Respond {
        /// Instance ID
        instance_id: String,
        /// Interaction ID
        interaction_id: String,
        /// Respondent email
        #[arg(short, long)]
        respondent: String,
        /// Answer as JSON
        #[arg(short, long)]
        data: Option<String>,
        /// Report a completed signature instead of a form answer
        #[arg(long)]
        signature: bool,
    },
    /// Render a smart-value template
    Resolve {
        /// Template, e.g. "Hello ${{activity.name}}"
        template: String,
        /// Render against a stored activity
        #[arg(short, long, conflicts_with = "json")]
        activity: Option<String>,
        /// Render against an inline activity JSON object
        #[arg(short, long)]
        json: Option<String>,
    },
    /// Translate between recurrence descriptors and cron
    Cron {
        #[command(subcommand)]
        action: CronActions,
    },
    /// Manage schedules
    Schedules {
        #[command(subcommand)]
        action: ScheduleActions,
    },
    /// Run the scheduler until interrupted
    Serve,
}

#[derive(Subcommand)]
enum DefinitionActions {
    /// Check a definition file without storing it
    Validate {
        /// Path to definition YAML/JSON file
        file: String,
    },
    /// Store a definition file as a new draft
    Import {
        /// Path to definition YAML/JSON file
        file: String,
        /// Logical workflow ID (created if missing)
        #[arg(short, long)]
        workflow: String,
        /// Display name for a new workflow
        #[arg(short, long)]
        name: Option<String>,
        /// Bind a new workflow to this form
        #[arg(short, long)]
        form: Option<String>,
        /// Publish right after importing
        #[arg(long)]
        publish: bool,
    },
    /// Publish a draft definition
    Publish {
        /// Definition ID
        definition_id: String,
    },
    /// List the versions of a workflow
    List {
        /// Logical workflow ID
        workflow: String,
    },
}

#[derive(Subcommand)]
enum ActivityActions {
    /// Open an activity and start the workflow bound to its form
    Open {
        /// Form ID
        #[arg(short, long)]
        form: String,
        /// Activity name
        #[arg(short, long)]
        name: String,
        /// Field values (id=value, value parsed as JSON when possible)
        #[arg(long = "field", value_parser = parse_var)]
        fields: Vec<(String, String)>,
        /// Users (name=email)
        #[arg(long = "user", value_parser = parse_var)]
        users: Vec<(String, String)>,
    },
    /// Start a specific workflow on an existing activity
    Start {
        /// Activity ID
        activity_id: String,
        /// Logical workflow ID
        workflow: String,
    },
    /// Change an activity's status
    Status {
        /// Activity ID
        activity_id: String,
        /// Status ID
        status_id: String,
    },
    /// Show an activity with its instances and open interactions
    Show {
        /// Activity ID
        activity_id: String,
    },
}

#[derive(Subcommand)]
enum StatusActions {
    /// Create or update a status
    Set {
        id: String,
        name: String,
        /// progress, done or canceled
        kind: String,
    },
}

#[derive(Subcommand)]
enum CronActions {
    /// Descriptor to cron
    Encode {
        #[arg(short, long)]
        interval: u32,
        /// minute, hour, day, week or month
        #[arg(short, long)]
        unit: String,
        /// HH:MM
        #[arg(short, long, default_value = "00:00")]
        time: String,
        #[arg(long)]
        day_of_month: Option<u32>,
    },
    /// Cron to descriptor
    Decode {
        /// 5-field cron expression
        expr: String,
    },
}

#[derive(Subcommand)]
enum ScheduleActions {
    /// Create a schedule
    Create {
        #[arg(short, long)]
        name: String,
        /// Logical workflow ID
        #[arg(short, long)]
        workflow: String,
        /// Form of the activities to open
        #[arg(short, long)]
        form: String,
        /// 5-field cron expression
        #[arg(long)]
        cron: String,
        /// IANA name or UTC offset
        #[arg(short, long)]
        timezone: Option<String>,
        /// RFC3339 start (defaults to now)
        #[arg(long)]
        start: Option<String>,
        /// RFC3339 end
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        repeat_limit: Option<u32>,
    },
    /// List schedules
    List {
        /// Include inactive schedules
        #[arg(short, long)]
        all: bool,
    },
    /// Deactivate a schedule and cancel its pending executions
    Deactivate {
        /// Schedule ID
        id: String,
    },
}

fn parse_var(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid format '{}'. Expected key=value", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Definitions { action } => match action {
            DefinitionActions::Validate { file } => cmd_definitions_validate(&file)?,
            DefinitionActions::Import {
                file,
                workflow,
                name,
                form,
                publish,
            } => {
                cmd_definitions_import(
                    &config,
                    &file,
                    &workflow,
                    name.as_deref(),
                    form.as_deref(),
                    publish,
                )
                .await?
            }
            DefinitionActions::Publish { definition_id } => {
                cmd_definitions_publish(&config, &definition_id).await?
            }
            DefinitionActions::List { workflow } => {
                cmd_definitions_list(&config, &workflow).await?
            }
        },
        Commands::Activities { action } => match action {
            ActivityActions::Open {
                form,
                name,
                fields,
                users,
            } => cmd_activities_open(&config, &form, &name, &fields, &users).await?,
            ActivityActions::Start {
                activity_id,
                workflow,
            } => {
                let executor = build_executor(&config)?;
                let started = executor.start_instance(&activity_id, &workflow).await?;
                print_json(&started)?;
            }
            ActivityActions::Status {
                activity_id,
                status_id,
            } => {
                let executor = build_executor(&config)?;
                let superseded = executor
                    .change_activity_status(&activity_id, &status_id)
                    .await?;
                println!("✓ Status changed ({} interaction(s) superseded)", superseded);
            }
            ActivityActions::Show { activity_id } => {
                cmd_activities_show(&config, &activity_id).await?
            }
        },
        Commands::Statuses { action } => match action {
            StatusActions::Set { id, name, kind } => {
                let kind: StatusKind = kind.parse().map_err(anyhow::Error::msg)?;
                let storage = get_storage(&config)?;
                storage.save_status(&StatusRef::new(&id, &name, kind)).await?;
                println!("✓ Status '{}' saved", id);
            }
        },
        Commands::Advance { instance_id } => {
            let executor = build_executor(&config)?;
            let result = executor.advance(&instance_id, Trigger::Tick).await?;
            print_json(&result)?;
        }
        Commands::Respond {
            instance_id,
            interaction_id,
            respondent,
            data,
            signature,
        } => {
            let trigger = if signature {
                Trigger::SignatureCompleted {
                    interaction_id,
                    signer: respondent,
                }
            } else {
                Trigger::InteractionResponse {
                    interaction_id,
                    respondent,
                    data: parse_json_arg(data.as_deref())?,
                }
            };
            let executor = build_executor(&config)?;
            let result = executor.advance(&instance_id, trigger).await?;
            print_json(&result)?;
        }
        Commands::Resolve {
            template,
            activity,
            json,
        } => cmd_resolve(&config, &template, activity.as_deref(), json.as_deref()).await?,
        Commands::Cron { action } => match action {
            CronActions::Encode {
                interval,
                unit,
                time,
                day_of_month,
            } => {
                let unit: Unit = unit.parse()?;
                let mut descriptor = Descriptor::new(interval, unit, &time)?;
                if let Some(day) = day_of_month {
                    descriptor = descriptor.with_day_of_month(day);
                    descriptor.validate()?;
                }
                println!("{}", recurrence::to_cron(&descriptor));
            }
            CronActions::Decode { expr } => {
                let descriptor = recurrence::from_cron(&expr)?;
                print_json(&descriptor)?;
            }
        },
        Commands::Schedules { action } => match action {
            ScheduleActions::Create {
                name,
                workflow,
                form,
                cron,
                timezone,
                start,
                end,
                repeat_limit,
            } => {
                let mut schedule = ScheduleDefinition::new(&name, &workflow, &form, &cron);
                schedule.timezone =
                    timezone.unwrap_or_else(|| config.scheduler.default_timezone.clone());
                if let Some(start) = start {
                    schedule.start_at = parse_timestamp(&start)?;
                }
                schedule.end_at = end.as_deref().map(parse_timestamp).transpose()?;
                schedule.repeat_limit = repeat_limit;

                let storage = get_storage(&config)?;
                create_schedule(&storage, &schedule).await?;
                println!("✓ Schedule '{}' created ({})", schedule.name, schedule.id);
            }
            ScheduleActions::List { all } => cmd_schedules_list(&config, all).await?,
            ScheduleActions::Deactivate { id } => {
                let storage = get_storage(&config)?;
                if storage.get_schedule(&id).await?.is_none() {
                    anyhow::bail!("Schedule not found: {}", id);
                }
                let canceled = storage.set_schedule_active(&id, false).await?;
                println!(
                    "✓ Schedule deactivated ({} pending execution(s) canceled)",
                    canceled
                );
            }
        },
        Commands::Serve => cmd_serve(config).await?,
    }

    Ok(())
}

// ============================================================================
// Definition Commands
// ============================================================================

fn cmd_definitions_validate(file: &str) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }

    let definition = parse_definition_file(path)?;
    let errors = validate_definition(&definition);
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("  ✗ {}", error);
        }
        anyhow::bail!("Definition has {} problem(s)", errors.len());
    }

    println!("✓ Definition is valid");
    println!();
    println!("  Steps: {}", definition.steps.len());
    let waits = definition
        .steps
        .iter()
        .filter(|s| s.kind.is_suspension_point())
        .count();
    if waits > 0 {
        println!("  Suspension points: {}", waits);
    }

    Ok(())
}

async fn cmd_definitions_import(
    config: &Config,
    file: &str,
    workflow_id: &str,
    name: Option<&str>,
    form: Option<&str>,
    publish: bool,
) -> anyhow::Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        anyhow::bail!("File not found: {}", file);
    }
    let parsed = parse_definition_file(path)?;

    let storage = get_storage(config)?;
    if storage.get_workflow(workflow_id).await?.is_none() {
        storage
            .save_workflow(&StoredWorkflow {
                id: workflow_id.to_string(),
                name: name.unwrap_or(workflow_id).to_string(),
                form_id: form.map(str::to_string),
                created_at: Utc::now(),
            })
            .await?;
        println!("✓ Workflow '{}' created", workflow_id);
    }

    let mut definition = storage.create_draft(workflow_id, &parsed.steps).await?;
    println!(
        "✓ Draft v{} imported ({}, {} steps)",
        definition.version,
        definition.id,
        definition.steps.len()
    );

    if publish {
        definition = storage.publish_definition(&definition.id).await?;
        println!("✓ Published v{}", definition.version);
    } else {
        println!();
        println!(
            "Publish with: streamline definitions publish {}",
            definition.id
        );
    }

    Ok(())
}

async fn cmd_definitions_publish(config: &Config, definition_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let definition = storage.publish_definition(definition_id).await?;
    println!(
        "✓ Workflow '{}' v{} published",
        definition.workflow_id, definition.version
    );
    Ok(())
}

async fn cmd_definitions_list(config: &Config, workflow_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let definitions = storage.list_definitions(workflow_id).await?;

    if definitions.is_empty() {
        println!("No definitions for '{}'.", workflow_id);
        return Ok(());
    }

    println!("{:<38} {:<8} {:<10} {:<6}", "ID", "VERSION", "STATUS", "STEPS");
    println!("{}", "-".repeat(64));
    for definition in definitions {
        println!(
            "{:<38} {:<8} {:<10} {:<6}",
            definition.id,
            definition.version,
            definition.status,
            definition.steps.len()
        );
    }
    Ok(())
}

// ============================================================================
// Activity Commands
// ============================================================================

async fn cmd_activities_open(
    config: &Config,
    form: &str,
    name: &str,
    fields: &[(String, String)],
    users: &[(String, String)],
) -> anyhow::Result<()> {
    let mut activity = Activity::new(form, name, StatusRef::default());
    for (id, raw) in fields {
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()));
        activity.upsert_field(id, value);
    }
    activity.users = users
        .iter()
        .enumerate()
        .map(|(i, (name, email))| ActivityUser::new(&format!("u{}", i + 1), name, email))
        .collect();
    let activity_id = activity.id.clone();

    let executor = build_executor(config)?;
    match executor.open_activity(activity).await? {
        Some(started) => print_json(&started)?,
        None => println!("✓ Activity {} opened (no workflow bound to '{}')", activity_id, form),
    }
    Ok(())
}

async fn cmd_activities_show(config: &Config, activity_id: &str) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let activity = storage
        .get_activity(activity_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Activity not found: {}", activity_id))?;
    let instances = storage.list_instances(activity_id).await?;
    let interactions = storage.list_open_interactions(activity_id).await?;

    print_json(&serde_json::json!({
        "activity": activity,
        "instances": instances,
        "open_interactions": interactions,
    }))
}

async fn cmd_resolve(
    config: &Config,
    template: &str,
    activity_id: Option<&str>,
    json: Option<&str>,
) -> anyhow::Result<()> {
    let snapshot = match (activity_id, json) {
        (Some(id), _) => {
            let storage = get_storage(config)?;
            let activity = storage
                .get_activity(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Activity not found: {}", id))?;
            let vars = storage.get_variables().await?;
            Snapshot::from_activity(&activity).with_vars(vars)
        }
        (None, Some(raw)) => Snapshot::from_json(&serde_json::from_str(raw)?),
        (None, None) => Snapshot::default(),
    };

    println!("{}", resolve(template, &snapshot));
    Ok(())
}

// ============================================================================
// Schedule Commands
// ============================================================================

async fn cmd_schedules_list(config: &Config, all: bool) -> anyhow::Result<()> {
    let storage = get_storage(config)?;
    let schedules = storage.list_schedules(!all).await?;

    if schedules.is_empty() {
        println!("No schedules found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<16} {:<18} {:<7}",
        "ID", "NAME", "CRON", "TIMEZONE", "ACTIVE"
    );
    println!("{}", "-".repeat(106));
    for schedule in schedules {
        println!(
            "{:<38} {:<24} {:<16} {:<18} {:<7}",
            schedule.id,
            schedule.name,
            schedule.cron,
            schedule.timezone,
            if schedule.active { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics.listen {
        metrics::init_metrics(Some(addr))?;
    }

    let executor = Arc::new(build_executor(&config)?);
    let scheduler = Scheduler::new(executor, config.scheduler.clone()).await?;
    scheduler.start().await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();

    println!("streamline scheduler running");
    println!();
    println!("Database: {}", config.database_path().display());
    println!("Sweep: {}", config.scheduler.sweep_cron);
    if let Some(addr) = config.metrics.listen {
        println!("Metrics: http://{}/metrics", addr);
    }
    println!();
    println!("Press Ctrl+C to stop");

    shutdown.wait_for_shutdown().await;
    scheduler.stop().await?;

    println!("Scheduler stopped.");
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn get_storage(config: &Config) -> anyhow::Result<SqliteStorage> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStorage::open(&db_path)?)
}

fn build_executor(config: &Config) -> anyhow::Result<Executor> {
    let storage = get_storage(config)?;
    let collaborators = Collaborators::from_config(config)?;
    Ok(Executor::new(storage, collaborators).with_config(config.engine.clone()))
}

fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Value::Object(Default::default())),
    }
}

fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
