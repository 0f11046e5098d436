//! attend: command-line client for the attendance daemon.
//!
//! Every subcommand is one request over the daemon socket. Response data is
//! printed as pretty JSON; daemon errors go to stderr with exit status 1.

mod daemon_client;

use attendance_protocol::{Method, Request};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "attend")]
#[command(about = "Attendance tracker client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status, counts and sweep schedule
    Health,

    /// Toggle presence for a scanned tag
    Scan {
        #[arg(value_name = "TAG")]
        tag_id: String,
    },

    /// Sign a member in (fails if already present)
    SignIn(IdentityArgs),

    /// Sign a member out (fails if not present)
    SignOut(IdentityArgs),

    /// Sign everyone out now, as the nightly sweep does
    SignOutAll,

    /// List who is currently present, earliest arrival first
    Present,

    /// Number of people currently present
    Count,

    /// Query completed sessions, newest first
    History {
        #[command(flatten)]
        range: RangeArgs,

        /// Maximum number of sessions to return
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Delete completed sessions matching a filter (one filter is required)
    DeleteHistory {
        #[command(flatten)]
        range: RangeArgs,
    },

    /// Most recent raw scans, newest first
    Scans,

    /// Manage registered members
    Members {
        #[command(subcommand)]
        command: MemberCommands,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct IdentityArgs {
    /// Tag identifier
    #[arg(long = "tag")]
    tag_id: Option<String>,

    /// External (chat platform) identifier
    #[arg(long)]
    external_id: Option<String>,
}

#[derive(Args)]
struct RangeArgs {
    /// Inclusive lower bound on sign-in time (RFC 3339)
    #[arg(long)]
    from: Option<String>,

    /// Inclusive upper bound on sign-in time (RFC 3339)
    #[arg(long)]
    to: Option<String>,

    /// Restrict to one member
    #[arg(long)]
    member_id: Option<i64>,
}

#[derive(Subcommand)]
enum MemberCommands {
    /// List all members
    List,

    /// Register a member
    Add(MemberFields),

    /// Replace a member's fields
    Update {
        #[arg(value_name = "ID")]
        id: i64,

        #[command(flatten)]
        fields: MemberFields,
    },

    /// Remove a member and their history (refused while they are present)
    Remove {
        #[arg(value_name = "ID")]
        id: i64,
    },

    /// Write all members to members.json in the daemon data directory
    Export,

    /// Add members from members.json, skipping tags already registered
    Import,
}

#[derive(Args)]
struct MemberFields {
    #[arg(long)]
    name: String,

    #[arg(long = "tag")]
    tag_id: String,

    #[arg(long)]
    external_id: String,
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let request = build_request(cli.command);

    match daemon_client::call(request) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                tracing::error!(error = %err, "Failed to format response");
                std::process::exit(1);
            }
        },
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_request(command: Commands) -> Request {
    let (method, params) = match command {
        Commands::Health => (Method::GetHealth, None),
        Commands::Scan { tag_id } => (Method::Scan, Some(json!({ "tag_id": tag_id }))),
        Commands::SignIn(who) => (Method::SignIn, Some(identity_params(who))),
        Commands::SignOut(who) => (Method::SignOut, Some(identity_params(who))),
        Commands::SignOutAll => (Method::SignOutAll, None),
        Commands::Present => (Method::GetPresent, None),
        Commands::Count => (Method::GetCount, None),
        Commands::History { range, limit } => {
            let mut params = range_params(range);
            if let Some(limit) = limit {
                params.insert("limit".to_string(), json!(limit));
            }
            (Method::GetHistory, Some(Value::Object(params)))
        }
        Commands::DeleteHistory { range } => {
            (Method::DeleteHistory, Some(Value::Object(range_params(range))))
        }
        Commands::Scans => (Method::GetScanHistory, None),
        Commands::Members { command } => match command {
            MemberCommands::List => (Method::ListMembers, None),
            MemberCommands::Add(fields) => (Method::CreateMember, Some(member_params(fields))),
            MemberCommands::Update { id, fields } => {
                let mut params = member_params(fields);
                params["id"] = json!(id);
                (Method::UpdateMember, Some(params))
            }
            MemberCommands::Remove { id } => (Method::DeleteMember, Some(json!({ "id": id }))),
            MemberCommands::Export => (Method::ExportMembers, None),
            MemberCommands::Import => (Method::ImportMembers, None),
        },
    };
    Request::new(method, params)
}

fn identity_params(who: IdentityArgs) -> Value {
    match (who.tag_id, who.external_id) {
        (Some(tag_id), _) => json!({ "tag_id": tag_id }),
        (None, Some(external_id)) => json!({ "external_id": external_id }),
        // clap's group makes this unreachable; the daemon reports the missing field.
        (None, None) => json!({}),
    }
}

fn range_params(range: RangeArgs) -> Map<String, Value> {
    let mut params = Map::new();
    if let Some(from) = range.from {
        params.insert("from".to_string(), json!(from));
    }
    if let Some(to) = range.to {
        params.insert("to".to_string(), json!(to));
    }
    if let Some(member_id) = range.member_id {
        params.insert("member_id".to_string(), json!(member_id));
    }
    params
}

fn member_params(fields: MemberFields) -> Value {
    json!({
        "name": fields.name,
        "tag_id": fields.tag_id,
        "external_id": fields.external_id,
    })
}
