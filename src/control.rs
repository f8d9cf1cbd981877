//! Operator command surface for the backup service.
//!
//! A tiny text parser plus a dispatcher that turns commands into calls on a
//! shared [`BackupScheduler`] and returns a one-line reply for the operator.
//!
//! ```text
//! backup                              trigger a backup now
//! backup set interval <hours> <mins>  change the schedule
//! backup set maxbackups <count>       change how many archives are kept
//! backup get interval                 current interval in minutes
//! backup get maxbackups               current retention count
//! backup status                       settings plus archive summary
//! backup credits                      who maintains this service
//! backup help                         this text
//! ```
//!
//! Keywords are case-insensitive. Bad input never changes state.
use log::{trace, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{BackupError, Result};
use crate::storage::{list_archives, BackupScheduler};

pub const USAGE: &str = "Usage: backup | backup set interval <hours> <minutes> | \
backup set maxbackups <count> | backup get interval | backup get maxbackups | backup status | \
backup credits";

pub const CREDITS: &str = "Tempus world backups, built and maintained by the Tempus contributors.";

const UNKNOWN_REPLY: &str = "Unknown command. Try 'backup help'.";

#[derive(Debug, PartialEq, Eq)]
pub enum BackupCommand {
    Trigger,
    SetInterval { hours: i64, minutes: i64 },
    SetMaxBackups(i64),
    GetInterval,
    GetMaxBackups,
    Status,
    Credits,
    Help,
    /// Not a backup command at all.
    Unknown,
    /// A backup command with bad arguments.
    Invalid(String),
}

pub struct BackupCommandParser;

impl BackupCommandParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> BackupCommand {
        let words: Vec<&str> = raw.split_whitespace().collect();
        let Some((head, rest)) = words.split_first() else {
            return BackupCommand::Unknown;
        };
        if !head.eq_ignore_ascii_case("backup") {
            return BackupCommand::Unknown;
        }
        let lowered: Vec<String> = rest.iter().map(|w| w.to_ascii_lowercase()).collect();
        let parts: Vec<&str> = lowered.iter().map(String::as_str).collect();
        trace!("Parsed backup command {:?} from '{}'", parts, raw);

        match parts.as_slice() {
            [] => BackupCommand::Trigger,
            ["help"] | ["?"] => BackupCommand::Help,
            ["status"] => BackupCommand::Status,
            ["credits"] => BackupCommand::Credits,
            ["get", "interval"] => BackupCommand::GetInterval,
            ["get", "maxbackups"] => BackupCommand::GetMaxBackups,
            ["set", "interval", hours, minutes] => match (parse_int(hours), parse_int(minutes)) {
                (Some(hours), Some(minutes)) => BackupCommand::SetInterval { hours, minutes },
                _ => BackupCommand::Invalid("hours and minutes must be whole numbers".into()),
            },
            ["set", "interval", ..] => {
                BackupCommand::Invalid("expected: backup set interval <hours> <minutes>".into())
            }
            ["set", "maxbackups", count] => match parse_int(count) {
                Some(count) => BackupCommand::SetMaxBackups(count),
                None => BackupCommand::Invalid("count must be a whole number".into()),
            },
            ["set", "maxbackups", ..] => {
                BackupCommand::Invalid("expected: backup set maxbackups <count>".into())
            }
            _ => BackupCommand::Invalid(format!("unknown subcommand '{}'", rest.join(" "))),
        }
    }
}

impl Default for BackupCommandParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(s: &str) -> Option<i64> {
    s.parse().ok()
}

/// Why [`ControlSurface::serve`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum InputEnd {
    /// The operator typed `stop` or `quit`.
    Stop,
    /// The input reached end of file.
    Closed,
}

/// Dispatches operator commands onto a scheduler.
#[derive(Clone)]
pub struct ControlSurface {
    scheduler: BackupScheduler,
}

impl ControlSurface {
    pub fn new(scheduler: BackupScheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    /// Parse and run one line. `Ok(None)` when the line is not a backup
    /// command, so a host can pass it on to other handlers.
    pub fn handle_line(&self, raw: &str) -> Result<Option<String>> {
        match BackupCommandParser::new().parse(raw) {
            BackupCommand::Unknown => Ok(None),
            cmd => self.execute(cmd).map(Some),
        }
    }

    /// Answer commands line by line until the operator stops or the input
    /// closes. What happens next is up to the host.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> std::io::Result<InputEnd>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.eq_ignore_ascii_case("stop") || trimmed.eq_ignore_ascii_case("quit") {
                return Ok(InputEnd::Stop);
            }
            if trimmed.is_empty() {
                continue;
            }
            let reply = match self.handle_line(trimmed) {
                Ok(Some(reply)) => reply,
                Ok(None) => UNKNOWN_REPLY.to_string(),
                Err(e) => {
                    warn!("Rejected command '{}': {}", trimmed, e);
                    e.to_string()
                }
            };
            output.write_all(reply.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok(InputEnd::Closed)
    }

    pub fn execute(&self, cmd: BackupCommand) -> Result<String> {
        match cmd {
            BackupCommand::Trigger => {
                self.scheduler.trigger_backup();
                Ok("Backup started.".to_string())
            }
            BackupCommand::SetInterval { hours, minutes } => {
                self.scheduler.set_interval(hours, minutes)?;
                Ok(format!(
                    "Backup interval set to {} hours and {} minutes.",
                    hours, minutes
                ))
            }
            BackupCommand::SetMaxBackups(count) => {
                let count = self.scheduler.set_max_backups(count)?;
                Ok(format!("Max backups set to {} files.", count))
            }
            BackupCommand::GetInterval => Ok(format!(
                "Current backup interval: {} minutes.",
                self.scheduler.interval_minutes()
            )),
            BackupCommand::GetMaxBackups => Ok(format!(
                "Current max backups: {} files.",
                self.scheduler.max_backups()
            )),
            BackupCommand::Status => Ok(self.status_line()),
            BackupCommand::Credits => Ok(CREDITS.to_string()),
            BackupCommand::Help => Ok(USAGE.to_string()),
            BackupCommand::Unknown => Err(BackupError::InvalidArgument(USAGE.to_string())),
            BackupCommand::Invalid(reason) => {
                Err(BackupError::InvalidArgument(format!("{}. {}", reason, USAGE)))
            }
        }
    }

    fn status_line(&self) -> String {
        let stats = self.scheduler.stats();
        let archives = match list_archives(&self.scheduler.job().backup_dir) {
            Ok(a) => a,
            Err(e) => {
                log::warn!("Could not list backups for status: {}", e);
                Vec::new()
            }
        };
        let newest = archives
            .last()
            .map(|a| a.file_name())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "Interval: {} minutes | Max backups: {} | On disk: {} | Newest: {} | Timer: {} | Cycles: {} ({} failed)",
            self.scheduler.interval_minutes(),
            self.scheduler.max_backups(),
            archives.len(),
            newest,
            if self.scheduler.is_running() { "running" } else { "stopped" },
            stats.cycles_run,
            stats.cycles_failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> BackupCommand {
        BackupCommandParser::new().parse(s)
    }

    #[test]
    fn parses_trigger_and_reads() {
        assert_eq!(parse("backup"), BackupCommand::Trigger);
        assert_eq!(parse("  BACKUP  "), BackupCommand::Trigger);
        assert_eq!(parse("backup get interval"), BackupCommand::GetInterval);
        assert_eq!(parse("backup Get MaxBackups"), BackupCommand::GetMaxBackups);
        assert_eq!(parse("backup status"), BackupCommand::Status);
        assert_eq!(parse("backup ?"), BackupCommand::Help);
        assert_eq!(parse("backup credits"), BackupCommand::Credits);
        assert_eq!(parse("backup CREDITS"), BackupCommand::Credits);
    }

    #[test]
    fn parses_setters() {
        assert_eq!(
            parse("backup set interval 1 30"),
            BackupCommand::SetInterval { hours: 1, minutes: 30 }
        );
        assert_eq!(
            parse("backup set interval -1 0"),
            BackupCommand::SetInterval { hours: -1, minutes: 0 }
        );
        assert_eq!(parse("backup set maxbackups 7"), BackupCommand::SetMaxBackups(7));
    }

    #[test]
    fn rejects_malformed_arguments() {
        assert!(matches!(parse("backup set interval 1"), BackupCommand::Invalid(_)));
        assert!(matches!(parse("backup set interval one 2"), BackupCommand::Invalid(_)));
        assert!(matches!(parse("backup set maxbackups"), BackupCommand::Invalid(_)));
        assert!(matches!(parse("backup set maxbackups 2.5"), BackupCommand::Invalid(_)));
        assert!(matches!(parse("backup restore"), BackupCommand::Invalid(_)));
        assert!(matches!(parse("backup credits please"), BackupCommand::Invalid(_)));
    }

    #[test]
    fn ignores_other_commands() {
        assert_eq!(parse(""), BackupCommand::Unknown);
        assert_eq!(parse("say hello"), BackupCommand::Unknown);
        assert_eq!(parse("backups"), BackupCommand::Unknown);
    }
}
