//! ClubMerge CLI - Main entry point for CLI binary
//!
//! This binary provides the `clubmerge` tool for managing clubs, merge
//! requests and the HTTP API server.

use anyhow::{bail, Context, Result};
use clap::Parser;
use clubmerge_lib::engine::{
    api::{create_router, ApiState},
    audit::AuditLog,
    cli::{
        formatter::{format_timestamp, CliFormatter},
        Cli, ClubAction, Commands, MemberAction, MergeAction, OutputFormat,
    },
    config::{Config, CONFIG_FILE},
    database::Database,
    directory::SqliteClubDirectory,
    merge::{ClubId, MergeEngine, MergeError, MergeRequestId, UserId},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "clubmerge=info,tower_http=info";

fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { name } => {
            cmd_init(&name, cli.project.as_deref(), json_output)?;
        }
        Commands::Status => {
            cmd_status(&project_dir, json_output)?;
        }
        Commands::Club { action } => {
            cmd_club(action, &project_dir, json_output)?;
        }
        Commands::Member { action } => {
            cmd_member(action, &project_dir, json_output)?;
        }
        Commands::Merge { action } => {
            cmd_merge(action, &project_dir, json_output)?;
        }
        Commands::Serve { port, host } => {
            cmd_serve(&project_dir, host, port)?;
        }
    }

    Ok(())
}

/// An opened project: its config and database.
struct Project {
    dir: PathBuf,
    config: Config,
    db: Database,
}

impl Project {
    fn open(dir: &Path) -> Result<Self> {
        let config = Config::load(dir)
            .with_context(|| format!("no ClubMerge project at {} (run `clubmerge init`)", dir.display()))?;
        let db_path = config.database_path(dir);
        let db = Database::new(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            db,
        })
    }

    fn directory(&self) -> SqliteClubDirectory {
        SqliteClubDirectory::new(self.db.clone())
    }

    fn engine(&self) -> Result<MergeEngine> {
        let mut engine = MergeEngine::sqlite(&self.db).with_max_write_retries(self.config.merge.max_write_retries);
        if let Some(audit_dir) = self.config.audit_dir(&self.dir) {
            let audit = AuditLog::new(&audit_dir)
                .with_context(|| format!("failed to open audit log in {}", audit_dir.display()))?;
            engine = engine.with_audit(audit);
        }
        Ok(engine)
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_init(name: &str, explicit_dir: Option<&Path>, json: bool) -> Result<()> {
    let project_dir = match explicit_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::home_dir()
            .context("could not find home directory")?
            .join("ClubMerge")
            .join("projects")
            .join(name),
    };

    if project_dir.join(CONFIG_FILE).exists() {
        bail!("project already initialized: {}", project_dir.display());
    }
    std::fs::create_dir_all(&project_dir)?;

    let config = Config::default_for_project(name);
    config.save(&project_dir)?;

    let db_path = config.database_path(&project_dir);
    let db = Database::new(&db_path)?;
    let status = db.migration_status()?;

    if json {
        print_json(&serde_json::json!({
            "success": true,
            "project_dir": project_dir.display().to_string(),
            "name": name,
            "migrations_applied": status.applied,
        }))?;
    } else {
        CliFormatter::success(&format!("Created ClubMerge project: {}", name));
        CliFormatter::kv("Directory", &project_dir.display().to_string());
        CliFormatter::kv("Database", &db_path.display().to_string());
        CliFormatter::kv("Migrations", &status.applied_count.to_string());
        CliFormatter::header("Next steps");
        CliFormatter::item(&format!("cd {}", project_dir.display()));
        CliFormatter::item("clubmerge club add --name \"Chess Club\"");
        CliFormatter::item("clubmerge serve");
    }

    Ok(())
}

fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let status = project.db.migration_status()?;
    let clubs = project.db.count_rows("clubs")?;
    let requests = project.db.count_rows("merge_requests")?;
    let tables = project.db.get_tables()?;

    if json {
        print_json(&serde_json::json!({
            "project": project.config.project.name,
            "database": project.config.database.path.display().to_string(),
            "api_port": project.config.api.port,
            "migrations_applied": status.applied_count,
            "migrations_pending": status.pending_count,
            "clubs": clubs,
            "merge_requests": requests,
            "tables": tables,
        }))?;
    } else {
        CliFormatter::header("ClubMerge Project Status");
        CliFormatter::kv("Project", &project.config.project.name);
        CliFormatter::kv("Database", &project.config.database.path.display().to_string());
        CliFormatter::kv("API", &format!("{}:{}", project.config.api.host, project.config.api.port));
        CliFormatter::kv(
            "Migrations",
            &format!("{} applied, {} pending", status.applied_count, status.pending_count),
        );
        CliFormatter::kv("Clubs", &clubs.to_string());
        CliFormatter::kv("Merge requests", &requests.to_string());
    }

    Ok(())
}

fn cmd_club(action: ClubAction, project_dir: &Path, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let directory = project.directory();

    match action {
        ClubAction::Add { name, description } => {
            let club = directory.create_club(&name, &description)?;
            if json {
                print_json(&club)?;
            } else {
                CliFormatter::success(&format!("Created club {} ({})", club.name, club.id));
            }
        }
        ClubAction::List => {
            let clubs = directory.list_clubs()?;
            if json {
                print_json(&clubs)?;
            } else if clubs.is_empty() {
                CliFormatter::info("No clubs yet");
            } else {
                CliFormatter::table_header(&["ID", "Name", "Created"]);
                for club in &clubs {
                    CliFormatter::table_row(&[
                        &club.id.to_string(),
                        &club.name,
                        &format_timestamp(&club.created_at),
                    ]);
                }
            }
        }
        ClubAction::Remove { club_id } => {
            directory.delete_club(ClubId(club_id))?;
            if json {
                print_json(&serde_json::json!({ "success": true, "club_id": club_id }))?;
            } else {
                CliFormatter::success(&format!("Deleted club {}", club_id));
            }
        }
    }

    Ok(())
}

fn cmd_member(action: MemberAction, project_dir: &Path, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let directory = project.directory();

    match action {
        MemberAction::Add { club, user, role } => {
            let membership = directory.add_membership(UserId(user), ClubId(club), role)?;
            if json {
                print_json(&membership)?;
            } else {
                CliFormatter::success(&format!("User {} is now {} of club {}", user, role, club));
            }
        }
        MemberAction::List { club } => {
            let members = directory.list_members(ClubId(club))?;
            if json {
                print_json(&members)?;
            } else if members.is_empty() {
                CliFormatter::info(&format!("Club {} has no members", club));
            } else {
                CliFormatter::table_header(&["User", "Role", "Joined"]);
                for member in &members {
                    CliFormatter::table_row(&[
                        &member.user_id.to_string(),
                        member.role.as_str(),
                        &format_timestamp(&member.joined_at),
                    ]);
                }
            }
        }
    }

    Ok(())
}

fn cmd_merge(action: MergeAction, project_dir: &Path, json: bool) -> Result<()> {
    let project = Project::open(project_dir)?;
    let engine = project.engine()?;

    match action {
        MergeAction::Create { from, to, user } => {
            let request = engine.create(ClubId(from), ClubId(to), UserId(user))?;
            if json {
                print_json(&request)?;
            } else {
                CliFormatter::success(&format!("Proposed merging club {} with club {}", from, to));
                CliFormatter::merge_request(&request);
            }
        }
        MergeAction::List { club } => {
            let views = engine.views_for_club(ClubId(club))?;
            if json {
                print_json(&views)?;
            } else if views.is_empty() {
                CliFormatter::info(&format!("No merge requests for club {}", club));
            } else {
                CliFormatter::header(&format!("Merge requests for {}", views[0].club_name));
                for view in &views {
                    CliFormatter::merge_view(view);
                }
            }
        }
        MergeAction::Accept { merge_request_id, user } => {
            let request = match engine.accept(MergeRequestId(merge_request_id), UserId(user)) {
                Err(e @ MergeError::AggregationFailed { .. }) if !json => {
                    CliFormatter::warning(&format!(
                        "Both clubs accepted, but the merge did not complete. Retry with `clubmerge merge finalize {} --as {}`",
                        merge_request_id, user
                    ));
                    return Err(e.into());
                }
                result => result?,
            };
            if json {
                print_json(&serde_json::json!({
                    "merge_request": request,
                    "merged_club_id": request.merged_club_id,
                }))?;
            } else {
                match request.merged_club_id {
                    Some(club) => CliFormatter::success(&format!("Clubs merged into club {}", club)),
                    None => CliFormatter::success("Accepted; waiting for the other club"),
                }
                CliFormatter::merge_request(&request);
            }
        }
        MergeAction::Finalize { merge_request_id, user } => {
            let request = engine.finalize(MergeRequestId(merge_request_id), UserId(user))?;
            if json {
                print_json(&serde_json::json!({
                    "merge_request": request,
                    "merged_club_id": request.merged_club_id,
                }))?;
            } else {
                CliFormatter::success("Merge finalized");
                CliFormatter::merge_request(&request);
            }
        }
        MergeAction::Cancel { merge_request_id, user } => {
            engine.cancel(MergeRequestId(merge_request_id), UserId(user))?;
            if json {
                print_json(&serde_json::json!({ "status": true }))?;
            } else {
                CliFormatter::success(&format!("Cancelled merge request {}", merge_request_id));
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn cmd_serve(project_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let project = Project::open(project_dir)?;
    let engine = project.engine()?;

    let host = host.unwrap_or_else(|| project.config.api.host.clone());
    let port = port.unwrap_or(project.config.api.port);

    let app = create_router(ApiState {
        engine: Arc::new(engine),
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    CliFormatter::header("ClubMerge API Server");
    CliFormatter::kv("Project", &project.config.project.name);
    CliFormatter::kv("Listening", &format!("http://{}", addr));
    CliFormatter::info("Press Ctrl+C to stop");
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
