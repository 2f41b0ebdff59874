//! retype: batch record migrations
//!
//! Main binary with subcommands:
//! - `start`: Configure a job and count its records
//! - `step`: Process one batch
//! - `run`: Step until the job completes or Ctrl-C
//! - `reset`: Forget a job
//! - `status`: Show job progress

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::Result;
use retype_engine::{CursorStrategy, DEFAULT_BATCH_SIZE, JobId, SourceDeletePolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "retype")]
#[command(about = "Move records between types and rename their attributes in batches", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// SQLite database holding the records
    #[arg(long, global = true, env = "RETYPE_DB", default_value = "retype.db")]
    pub db: PathBuf,

    /// Job identifier; several jobs can run side by side
    #[arg(long, global = true, env = "RETYPE_JOB", default_value = "default")]
    pub job: String,

    /// Keep job documents as JSON files in this directory instead of the database
    #[arg(long, global = true, env = "RETYPE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Refuse to reclassify into types missing from the type registry
    #[arg(long, global = true, env = "RETYPE_REQUIRE_TYPES", value_parser = parse_bool_env, default_value = "false")]
    pub require_registered_types: bool,
}

impl GlobalArgs {
    pub fn job_id(&self) -> JobId {
        JobId::new(&self.job)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a new job, replacing any existing one
    Start {
        /// Type of the records to migrate
        #[arg(long)]
        from: String,

        /// Type to move records to (omit with --meta-only)
        #[arg(long, default_value = "")]
        to: String,

        /// Records per step (clamped to 10..=2000)
        #[arg(long, env = "RETYPE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE as i64, allow_negative_numbers = true)]
        batch_size: i64,

        /// Attribute rename rule such as "old_key => new_key" (repeatable)
        #[arg(long = "rename")]
        renames: Vec<String>,

        /// File with one rename rule per line
        #[arg(long)]
        rules_file: Option<PathBuf>,

        /// Delete source attribute keys after copying
        #[arg(long, value_parser = parse_bool_env, default_value = "false", num_args = 0..=1, default_missing_value = "true")]
        delete_old: bool,

        /// Only rename attributes, keep record types
        #[arg(long)]
        meta_only: bool,

        /// When to delete source keys if --delete-old is set
        #[arg(long, value_enum, default_value_t = DeletePolicyArg::Always)]
        delete_policy: DeletePolicyArg,

        /// How batches are selected
        #[arg(long, value_enum, default_value_t = CursorArg::Keyset)]
        cursor: CursorArg,
    },

    /// Process the next batch
    Step,

    /// Step until the job completes (Ctrl-C to pause)
    Run {
        /// Pause between steps in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Delete the job
    Reset,

    /// Show job progress
    Status {
        /// Print the raw job document
        #[arg(long)]
        json: bool,
    },

    /// Add a record type to the registry
    RegisterType {
        /// Type key
        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum DeletePolicyArg {
    /// Delete even if some values failed to copy
    Always,
    /// Keep the source key when any value failed to copy
    OnFullCopy,
}

impl From<DeletePolicyArg> for SourceDeletePolicy {
    fn from(arg: DeletePolicyArg) -> Self {
        match arg {
            DeletePolicyArg::Always => SourceDeletePolicy::Always,
            DeletePolicyArg::OnFullCopy => SourceDeletePolicy::OnFullCopy,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CursorArg {
    /// Resume after the last processed identifier
    Keyset,
    /// Skip the number of processed records
    Offset,
}

impl From<CursorArg> for CursorStrategy {
    fn from(arg: CursorArg) -> Self {
        match arg {
            CursorArg::Keyset => CursorStrategy::Keyset,
            CursorArg::Offset => CursorStrategy::Offset,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "retype=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let app = commands::App::open(&cli.global)?;

    match cli.command {
        Commands::Start {
            from,
            to,
            batch_size,
            renames,
            rules_file,
            delete_old,
            meta_only,
            delete_policy,
            cursor,
        } => {
            let mut rename_rules = renames.join("\n");
            if let Some(path) = rules_file {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
                rename_rules.push('\n');
                rename_rules.push_str(&text);
            }

            app.start(retype_engine::StartRequest {
                source_type: from,
                destination_type: to,
                batch_size,
                rename_rules,
                delete_old,
                meta_only,
                delete_policy: delete_policy.into(),
                cursor: cursor.into(),
            })
            .await
        }

        Commands::Step => app.step().await,

        Commands::Run { interval_ms } => app.run(interval_ms).await,

        Commands::Reset => app.reset().await,

        Commands::Status { json } => app.status(json).await,

        Commands::RegisterType { name } => app.register_type(&name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use test_case::test_case;

    #[test_case("1", true)]
    #[test_case("TRUE", true)]
    #[test_case("yes", true)]
    #[test_case("On", true)]
    #[test_case("0", false)]
    #[test_case("false", false)]
    #[test_case("no", false)]
    #[test_case("off", false)]
    #[test_case("", false)]
    fn test_parse_bool_env(raw: &str, expected: bool) {
        assert_eq!(parse_bool_env(raw), Ok(expected));
    }

    #[test]
    fn test_parse_bool_env_rejects_garbage() {
        assert!(parse_bool_env("maybe").is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_arguments() {
        let cli = Cli::try_parse_from([
            "retype",
            "--job",
            "Services",
            "start",
            "--from",
            "ex_service",
            "--to",
            "service",
            "--batch-size",
            "-3",
            "--rename",
            "old_price => price",
            "--delete-old",
            "yes",
            "--delete-policy",
            "on-full-copy",
            "--cursor",
            "offset",
        ])
        .unwrap();

        assert_eq!(cli.global.job_id().as_str(), "services");
        match cli.command {
            Commands::Start {
                batch_size,
                renames,
                delete_old,
                delete_policy,
                cursor,
                ..
            } => {
                assert_eq!(batch_size, -3);
                assert_eq!(renames, vec!["old_price => price".to_string()]);
                assert!(delete_old);
                assert_eq!(SourceDeletePolicy::from(delete_policy), SourceDeletePolicy::OnFullCopy);
                assert_eq!(CursorStrategy::from(cursor), CursorStrategy::Offset);
            }
            _ => panic!("expected start"),
        }
    }
}
