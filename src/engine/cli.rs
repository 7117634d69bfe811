//! ClubMerge CLI Module
//! Command-line interface for clubs and merge requests

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::rbac::Role;

#[derive(Parser, Debug)]
#[command(name = "clubmerge")]
#[command(version)]
#[command(about = "Two-sided club merge requests", long_about = None)]
pub struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new ClubMerge project
    Init {
        /// Project name
        #[arg(short, long)]
        name: String,
    },

    /// Show project status
    Status,

    /// Club directory management
    Club {
        #[command(subcommand)]
        action: ClubAction,
    },

    /// Club membership management
    Member {
        #[command(subcommand)]
        action: MemberAction,
    },

    /// Merge request commands
    Merge {
        #[command(subcommand)]
        action: MergeAction,
    },

    /// Start the HTTP API server
    Serve {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (defaults to the configured host)
        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ClubAction {
    /// Create a club
    Add {
        #[arg(short, long)]
        name: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List clubs
    List,

    /// Delete a club (refused while it has an open merge request)
    Remove {
        club_id: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum MemberAction {
    /// Add a user to a club, or change their role
    Add {
        #[arg(short, long)]
        club: i64,

        #[arg(short, long)]
        user: i64,

        /// member, organizer or admin
        #[arg(short, long, default_value = "organizer")]
        role: Role,
    },

    /// List a club's members
    List {
        #[arg(short, long)]
        club: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum MergeAction {
    /// Propose merging one club with another
    Create {
        /// Initiating club
        #[arg(long)]
        from: i64,

        /// Target club
        #[arg(long)]
        to: i64,

        /// Acting user
        #[arg(long = "as")]
        user: i64,
    },

    /// List merge requests as seen by a club
    List {
        #[arg(short, long)]
        club: i64,
    },

    /// Accept a merge request for the club you organize
    Accept {
        merge_request_id: i64,

        #[arg(long = "as")]
        user: i64,
    },

    /// Retry merging clubs for a request both sides accepted
    Finalize {
        merge_request_id: i64,

        #[arg(long = "as")]
        user: i64,
    },

    /// Withdraw an unmerged request
    Cancel {
        merge_request_id: i64,

        #[arg(long = "as")]
        user: i64,
    },
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}
