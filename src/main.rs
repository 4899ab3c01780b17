//! # chronitol
//!
//! Command-line front end for the reminder engine. Notifications go to an
//! in-process simulated center, so reminders only fire while `chronitol run`
//! is active; everything else (drugs, alarms, doses, snooze records)
//! persists under the data directory.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use chronitol_core::{AlarmId, AlarmTime, Calendar, DoseId, DrugId, PendingDosageInfo, SystemClock};
use chronitol_engine::{
    AlarmDraft, DoseListItem, DoseListSnapshot, DrugEdit, InMemoryNotificationCenter, NotificationAction,
    NotificationResponse, ReminderSystem, SectionKey,
};
use chronitol_settings::{load_settings, load_settings_from_path, ChronitolSettings};
use chronitol_telemetry::{init_telemetry, parse_level, LogQuery, TelemetryConfig, TelemetryGuard};

/// Medication reminders from the terminal.
#[derive(Parser, Debug)]
#[command(name = "chronitol", about = "Medication reminder engine")]
struct Cli {
    /// Settings file to load instead of `~/.chronitol/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage drugs.
    #[command(subcommand)]
    Drug(DrugCommand),
    /// Manage a drug's daily alarms.
    #[command(subcommand)]
    Alarm(AlarmCommand),
    /// Record and edit taken doses.
    #[command(subcommand)]
    Dose(DoseCommand),
    /// Print the dose list: due, upcoming, then history by day.
    View,
    /// Write a JSON backup to stdout or a file.
    Export {
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Load a JSON backup.
    Import {
        path: PathBuf,
        /// Delete everything first.
        #[arg(long)]
        reset: bool,
    },
    /// Show persisted warning and error logs.
    Logs(LogsArgs),
    /// Deliver reminders as they come due and accept actions on stdin until Ctrl-C.
    Run {
        /// How often the simulated center checks for due reminders.
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
enum DrugCommand {
    Add {
        name: String,
        /// Daily alarm time, `HH:MM`. Repeatable.
        #[arg(long = "alarm", value_parser = parse_alarm_time)]
        alarms: Vec<AlarmTime>,
        #[arg(long)]
        inactive: bool,
    },
    List,
    Edit {
        id: DrugId,
        #[arg(long)]
        name: Option<String>,
        /// Replace every alarm with these times.
        #[arg(long = "alarm", value_parser = parse_alarm_time)]
        alarms: Vec<AlarmTime>,
    },
    Remove {
        id: DrugId,
    },
    Activate {
        id: DrugId,
    },
    Deactivate {
        id: DrugId,
    },
}

#[derive(Subcommand, Debug)]
enum AlarmCommand {
    Add {
        drug_id: DrugId,
        #[arg(value_parser = parse_alarm_time)]
        time: AlarmTime,
    },
    Set {
        alarm_id: AlarmId,
        #[arg(value_parser = parse_alarm_time)]
        time: AlarmTime,
    },
    Remove {
        alarm_id: AlarmId,
    },
}

#[derive(Subcommand, Debug)]
enum DoseCommand {
    /// Log a dose for a drug, or take a pending reminder with `--reminder`.
    Take {
        #[arg(required_unless_present = "reminder")]
        drug_id: Option<DrugId>,
        /// When it was taken (RFC 3339). Defaults to now.
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,
        #[arg(long, conflicts_with = "drug_id")]
        reminder: Option<String>,
    },
    /// Skip a pending reminder.
    Skip {
        reminder: String,
    },
    List {
        #[arg(long)]
        drug: Option<DrugId>,
    },
    Retime {
        dose_id: DoseId,
        #[arg(value_parser = parse_timestamp)]
        at: DateTime<Utc>,
    },
    Remove {
        dose_id: DoseId,
    },
}

#[derive(Args, Debug)]
struct LogsArgs {
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    alarm: Option<String>,
    #[arg(long)]
    drug: Option<String>,
    #[arg(long, default_value = "50")]
    limit: u32,
}

fn parse_alarm_time(s: &str) -> Result<AlarmTime, String> {
    AlarmTime::parse(s).ok_or_else(|| format!("expected HH:MM, got {s:?}"))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp {s:?}: {e}"))
}

fn draft(time: AlarmTime) -> AlarmDraft {
    AlarmDraft::new(i64::from(time.hour()), i64::from(time.minute()))
}

fn telemetry_config(settings: &ChronitolSettings) -> TelemetryConfig {
    let logging = &settings.logging;
    TelemetryConfig {
        log_level: parse_level(&logging.level).unwrap_or(tracing::Level::INFO),
        module_levels: logging
            .module_levels
            .iter()
            .filter_map(|(module, level)| parse_level(level).map(|l| (module.clone(), l)))
            .collect(),
        json: logging.json,
        log_to_sqlite: logging.log_to_sqlite,
        log_db_path: settings.storage.log_database_path(),
    }
}

struct App {
    system: ReminderSystem,
    center: Arc<InMemoryNotificationCenter>,
    telemetry: TelemetryGuard,
}

async fn open_app(cli: &Cli) -> Result<App> {
    let settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };

    std::fs::create_dir_all(&settings.storage.data_dir)
        .with_context(|| format!("Failed to create data directory: {}", settings.storage.data_dir))?;
    let telemetry = init_telemetry(telemetry_config(&settings));

    let calendar = Calendar::from_name(settings.calendar.time_zone.as_deref())?;
    let clock = Arc::new(SystemClock);
    let center = Arc::new(InMemoryNotificationCenter::new(calendar, clock.clone()));
    let system = ReminderSystem::open(&settings, center.clone(), clock)
        .await
        .context("Failed to open reminder store")?;

    Ok(App {
        system,
        center,
        telemetry,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let app = open_app(&cli).await?;
    let _ = app.system.launch().await.context("Failed to start reminder engine")?;

    let result = dispatch(&app, cli.command).await;
    app.system.shutdown().await;
    result
}

async fn dispatch(app: &App, command: Command) -> Result<()> {
    let system = &app.system;
    match command {
        Command::Drug(cmd) => drug_command(system, cmd).await,
        Command::Alarm(cmd) => alarm_command(system, cmd).await,
        Command::Dose(cmd) => dose_command(system, cmd).await,
        Command::View => {
            let snapshot = system.foreground().await?;
            print_snapshot(&snapshot);
            Ok(())
        }
        Command::Export { output } => {
            let json = system.export_backup().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write backup to {}", path.display()))?;
                    println!("backup written to {}", path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
        Command::Import { path, reset } => {
            let data = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read backup {}", path.display()))?;
            let summary = system.import_backup(&data, reset).await?;
            println!(
                "imported {} drugs, {} alarms ({} inactive), {} doses",
                summary.drugs,
                summary.alarms.len() + summary.inactive_alarms,
                summary.inactive_alarms,
                summary.doses
            );
            Ok(())
        }
        Command::Logs(args) => show_logs(&app.telemetry, args),
        Command::Run { poll_ms } => run(app, StdDuration::from_millis(poll_ms.max(10))).await,
    }
}

async fn drug_command(system: &ReminderSystem, cmd: DrugCommand) -> Result<()> {
    let gateway = system.gateway();
    let scheduler = system.scheduler();
    match cmd {
        DrugCommand::Add {
            name,
            alarms,
            inactive,
        } => {
            let drug = scheduler
                .save_drug(DrugEdit {
                    drug_id: None,
                    name,
                    is_active: !inactive,
                    alarms: alarms.into_iter().map(draft).collect(),
                })
                .await?;
            println!("{}  {}", drug.id, drug.display_name());
        }
        DrugCommand::List => {
            for drug in gateway.all_drugs().await? {
                let alarms = gateway.alarms_for_drug(&drug.id).await?;
                let times: Vec<String> = alarms.iter().map(|a| a.time().to_string()).collect();
                let state = if drug.is_active { "active" } else { "inactive" };
                println!("{}  {}  [{}]  {}", drug.id, drug.display_name(), state, times.join(", "));
            }
        }
        DrugCommand::Edit { id, name, alarms } => {
            let drug = gateway
                .drug(&id)
                .await?
                .ok_or_else(|| anyhow!("drug not found: {id}"))?;
            let drafts = if alarms.is_empty() {
                gateway
                    .alarms_for_drug(&id)
                    .await?
                    .into_iter()
                    .map(|a| AlarmDraft {
                        id: Some(a.id.clone()),
                        ..draft(a.time())
                    })
                    .collect()
            } else {
                alarms.into_iter().map(draft).collect()
            };
            let saved = scheduler
                .save_drug(DrugEdit {
                    drug_id: Some(id),
                    name: name.unwrap_or(drug.name),
                    is_active: drug.is_active,
                    alarms: drafts,
                })
                .await?;
            println!("{}  {}", saved.id, saved.display_name());
        }
        DrugCommand::Remove { id } => {
            scheduler.delete_drug(&id).await?;
            println!("removed {id}");
        }
        DrugCommand::Activate { id } => {
            let drug = scheduler.set_drug_active(&id, true).await?;
            println!("{} is active", drug.display_name());
        }
        DrugCommand::Deactivate { id } => {
            let drug = scheduler.set_drug_active(&id, false).await?;
            println!("{} is inactive", drug.display_name());
        }
    }
    Ok(())
}

async fn alarm_command(system: &ReminderSystem, cmd: AlarmCommand) -> Result<()> {
    let scheduler = system.scheduler();
    match cmd {
        AlarmCommand::Add { drug_id, time } => {
            let alarm = scheduler
                .add_alarm(&drug_id, i64::from(time.hour()), i64::from(time.minute()))
                .await?;
            println!("{}  {}", alarm.id, alarm.time());
        }
        AlarmCommand::Set { alarm_id, time } => {
            let alarm = scheduler
                .update_alarm_time(&alarm_id, i64::from(time.hour()), i64::from(time.minute()))
                .await?;
            println!("{}  {}", alarm.id, alarm.time());
        }
        AlarmCommand::Remove { alarm_id } => {
            system.alarm_deleted(&alarm_id).await?;
            println!("removed {alarm_id}");
        }
    }
    Ok(())
}

async fn dose_command(system: &ReminderSystem, cmd: DoseCommand) -> Result<()> {
    let dose_log = system.dose_log();
    match cmd {
        DoseCommand::Take {
            reminder: Some(reminder),
            ..
        } => {
            let snapshot = system.foreground().await?;
            let info = find_pending(&snapshot, &reminder)?;
            match dose_log.take_pending(&info).await? {
                Some(dose) => println!("{}  {}  {}", dose.id, info.drug_name, format_time(dose.timestamp())),
                None => println!("{} is not due yet; nothing logged", info.drug_name),
            }
        }
        DoseCommand::Take { drug_id, at, .. } => {
            let drug_id = drug_id.ok_or_else(|| anyhow!("a drug id or --reminder is required"))?;
            let at = at.unwrap_or_else(Utc::now);
            let dose = dose_log.log_dose(&drug_id, at).await?;
            println!("{}  {}", dose.id, format_time(dose.timestamp()));
        }
        DoseCommand::Skip { reminder } => {
            let snapshot = system.foreground().await?;
            let info = find_pending(&snapshot, &reminder)?;
            dose_log.skip_pending(&info).await?;
            println!("skipped {}", info.drug_name);
        }
        DoseCommand::List { drug } => {
            let gateway = system.gateway();
            let names: HashMap<DrugId, String> = gateway
                .all_drugs()
                .await?
                .into_iter()
                .map(|d| (d.id.clone(), d.display_name().to_string()))
                .collect();
            let doses = match drug {
                Some(id) => gateway.doses_for_drug(&id).await?,
                None => gateway.dose_history().await?,
            };
            for dose in doses {
                let name = names.get(&dose.drug_id).map_or("?", String::as_str);
                println!("{}  {}  {}", dose.id, name, format_time(dose.timestamp()));
            }
        }
        DoseCommand::Retime { dose_id, at } => {
            let dose = dose_log.update_dose_time(&dose_id, at).await?;
            println!("{}  {}", dose.id, format_time(dose.timestamp()));
        }
        DoseCommand::Remove { dose_id } => {
            dose_log.delete_dose(&dose_id).await?;
            println!("removed {dose_id}");
        }
    }
    Ok(())
}

fn find_pending(snapshot: &DoseListSnapshot, reminder_id: &str) -> Result<PendingDosageInfo> {
    snapshot
        .pending()
        .iter()
        .flat_map(|s| s.items.iter())
        .find_map(|item| match item {
            DoseListItem::Pending(info) if info.reminder_id == reminder_id => Some(info.clone()),
            _ => None,
        })
        .ok_or_else(|| anyhow!("no pending reminder {reminder_id}"))
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M UTC").to_string()
}

fn print_snapshot(snapshot: &DoseListSnapshot) {
    for section in snapshot.sections() {
        match section.key {
            SectionKey::Due => println!("== Due"),
            SectionKey::Upcoming => println!("== Upcoming"),
            SectionKey::HistoryDay(day) => println!("== {}", day.format("%Y-%m-%d")),
        }
        for item in &section.items {
            match item {
                DoseListItem::Pending(info) => println!(
                    "  {}  {}  ({})",
                    format_time(info.due_timestamp.at()),
                    info.drug_name,
                    info.reminder_id
                ),
                DoseListItem::History(dose) => {
                    println!("  {}  {}  ({})", format_time(dose.timestamp), dose.drug_name, dose.id);
                }
            }
        }
    }
}

fn show_logs(telemetry: &TelemetryGuard, args: LogsArgs) -> Result<()> {
    let Some(sink) = telemetry.logs() else {
        bail!("log persistence is off; set logging.logToSqlite to true");
    };
    let records = sink.query(&LogQuery {
        level: args.level,
        alarm_id: args.alarm,
        drug_id: args.drug,
        limit: Some(args.limit),
        ..Default::default()
    })?;
    for record in records {
        println!("{} {:5} {} {}", record.timestamp, record.level, record.target, record.message);
    }
    Ok(())
}

const RUN_HELP: &str = "commands: taken <id> | snooze <id> <minutes> | tap <id> | dismiss <id> | ignore <id> | view";

async fn run(app: &App, poll: StdDuration) -> Result<()> {
    let system = &app.system;
    println!("{RUN_HELP}");
    let mut ticker = tokio::time::interval(poll);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for delivered in app.center.deliver_due() {
                    let content = &delivered.request.content;
                    println!("[{}] {} {}", delivered.request.id, content.title, content.body);
                }
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(error) = run_line(system, line.trim()).await {
                        println!("{error}");
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl+c")?;
                break;
            }
        }
    }
    tracing::info!("run loop finished");
    Ok(())
}

async fn run_line(system: &ReminderSystem, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(());
    };
    if verb == "view" {
        print_snapshot(&*system.foreground().await?);
        return Ok(());
    }

    let id = parts.next().ok_or_else(|| anyhow!("{RUN_HELP}"))?;
    let action = match verb {
        "taken" => NotificationAction::TakenNow,
        "tap" => NotificationAction::DefaultTap,
        "dismiss" => NotificationAction::Dismissed,
        "ignore" => NotificationAction::Ignored,
        "snooze" => {
            let minutes = match parts.next() {
                Some(m) => m.parse().with_context(|| format!("invalid minutes: {m}"))?,
                None => system.policy().shortest_snooze(),
            };
            NotificationAction::Snooze(minutes)
        }
        _ => bail!("{RUN_HELP}"),
    };

    let notification = system
        .notifications()
        .list_delivered()
        .await
        .into_iter()
        .find(|d| d.request.id == id)
        .ok_or_else(|| anyhow!("no delivered reminder {id}"))?;
    system
        .notifications()
        .submit_action(NotificationResponse { notification, action });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from(["chronitol", "drug", "add", "Aspirin", "--alarm", "08:00", "--alarm", "20:30"])
            .unwrap();
        match cli.command {
            Command::Drug(DrugCommand::Add { name, alarms, inactive }) => {
                assert_eq!(name, "Aspirin");
                assert_eq!(alarms, vec![AlarmTime::new(8, 0), AlarmTime::new(20, 30)]);
                assert!(!inactive);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_alarm_time() {
        assert!(Cli::try_parse_from(["chronitol", "alarm", "add", "drug-1", "8am"]).is_err());
    }

    #[test]
    fn dose_take_needs_drug_or_reminder() {
        assert!(Cli::try_parse_from(["chronitol", "dose", "take"]).is_err());
        assert!(Cli::try_parse_from(["chronitol", "dose", "take", "--reminder", "a1"]).is_ok());
        let cli = Cli::try_parse_from(["chronitol", "dose", "take", "d1", "--at", "2026-03-02T08:00:00Z"]).unwrap();
        match cli.command {
            Command::Dose(DoseCommand::Take { drug_id, at, reminder }) => {
                assert_eq!(drug_id, Some(DrugId::from_raw("d1")));
                assert_eq!(at, Some(parse_timestamp("2026-03-02T08:00:00Z").unwrap()));
                assert!(reminder.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn import_reset_flag() {
        let cli = Cli::try_parse_from(["chronitol", "import", "backup.json", "--reset"]).unwrap();
        assert!(matches!(cli.command, Command::Import { reset: true, .. }));
    }

    #[test]
    fn telemetry_config_from_settings() {
        let mut settings = ChronitolSettings::default();
        settings.logging.level = "warn".into();
        let levels = &mut settings.logging.module_levels;
        let _ = levels.insert("chronitol_engine::runner".into(), "debug".into());
        let _ = levels.insert("bogus".into(), "loud".into());
        let config = telemetry_config(&settings);
        assert_eq!(config.log_level, tracing::Level::WARN);
        assert_eq!(config.module_levels, vec![(String::from("chronitol_engine::runner"), tracing::Level::DEBUG)]);
    }
}
