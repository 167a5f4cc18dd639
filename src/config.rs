//! Command line and environment configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::compose::{
    CreateOptions, PullOptions, Recreate, RemoveOptions, StartOptions, StopOptions,
};
use crate::project::loader::find_compose_file;
use crate::project::ProjectOptions;

/// Compose file used by the walkthrough when nothing else is configured.
pub const DEFAULT_WALKTHROUGH_FILE: &str = "/home/ubuntu/junk/wp/docker-compose.yml";

#[derive(Debug, Parser)]
#[command(name = "bcompose", version, about = "Drive a compose project through the Docker Engine")]
pub struct Cli {
    /// Compose configuration files, merged in order
    #[arg(short = 'f', long = "file", global = true)]
    pub files: Vec<PathBuf>,

    /// Project name
    #[arg(short = 'p', long, global = true)]
    pub project_name: Option<String>,

    /// Alternate environment file
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Profiles to enable
    #[arg(long = "profile", env = "COMPOSE_PROFILES", value_delimiter = ',', global = true)]
    pub profiles: Vec<String>,

    /// Also log to a file (defaults to the user's data directory)
    #[arg(long, num_args = 0..=1, global = true)]
    pub log_file: Option<Option<PathBuf>>,

    /// More output, repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List running compose projects
    Ls {
        /// Show all stopped projects too
        #[arg(short, long)]
        all: bool,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
    /// Create networks, volumes and containers
    Create(CreateArgs),
    /// Pull service images
    Pull {
        /// Pull what it can and ignore images with pull failures
        #[arg(long)]
        ignore_pull_failures: bool,
        /// Pull without printing progress information
        #[arg(short, long)]
        quiet: bool,
    },
    /// Start the project's containers
    Start {
        /// Return as soon as containers are started
        #[arg(long)]
        no_wait: bool,
        /// Seconds to wait for running and healthy containers
        #[arg(long, default_value_t = 120)]
        wait_timeout: u64,
    },
    /// Stop the project's containers
    Stop {
        /// Shutdown timeout in seconds
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
    /// Remove the project's containers and networks
    Rm {
        /// Remove named volumes too
        #[arg(long)]
        volumes: bool,
    },
    /// Stream container events of the project
    Events {
        /// Output events as a stream of json objects
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved project
    Config,
    /// List, create, start, stop and remove the project in one go
    Walkthrough(WalkthroughArgs),
}

impl Default for Command {
    fn default() -> Self {
        Command::Walkthrough(WalkthroughArgs::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
}

#[derive(Debug, Default, Args)]
pub struct CreateArgs {
    /// Recreate containers even if their configuration hasn't changed
    #[arg(long, conflicts_with = "no_recreate")]
    pub force_recreate: bool,
    /// Keep existing containers even if their configuration changed
    #[arg(long)]
    pub no_recreate: bool,
    /// Remove containers for services not defined in the compose file
    #[arg(long)]
    pub remove_orphans: bool,
    /// Pull images that are missing before creating
    #[arg(long)]
    pub pull_missing: bool,
}

impl CreateArgs {
    pub fn options(&self) -> CreateOptions {
        CreateOptions {
            recreate: if self.force_recreate {
                Recreate::Force
            } else if self.no_recreate {
                Recreate::Never
            } else {
                Recreate::Diverged
            },
            remove_orphans: self.remove_orphans,
            pull_missing: self.pull_missing,
        }
    }
}

#[derive(Debug, Default, Args)]
pub struct WalkthroughArgs {
    /// Pull images before creating the project
    #[arg(long)]
    pub pull: bool,
    /// Do not stream lifecycle events while running
    #[arg(long)]
    pub no_events: bool,
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub fn log_file_path(&self) -> Option<PathBuf> {
        match &self.log_file {
            None => None,
            Some(Some(path)) => Some(path.clone()),
            Some(None) => directories::ProjectDirs::from("", "", "bcompose")
                .map(|dirs| dirs.data_local_dir().join("bcompose.log")),
        }
    }

    /// Loader options. The walkthrough falls back to its historic compose
    /// file when no other source of files is available.
    pub fn project_options(&self) -> ProjectOptions {
        let mut files = self.files.clone();
        if files.is_empty() && matches!(self.command, None | Some(Command::Walkthrough(_))) {
            let configured = std::env::var_os("COMPOSE_FILE").is_some()
                || std::env::current_dir()
                    .ok()
                    .and_then(|dir| find_compose_file(&dir))
                    .is_some();
            if !configured && Path::new(DEFAULT_WALKTHROUGH_FILE).is_file() {
                files.push(PathBuf::from(DEFAULT_WALKTHROUGH_FILE));
            }
        }

        ProjectOptions::new(files)
            .with_name(self.project_name.clone())
            .with_env_file(self.env_file.clone())
            .with_profiles(self.profiles.clone())
    }
}

pub fn start_options(no_wait: bool, wait_timeout: u64) -> StartOptions {
    StartOptions {
        wait: !no_wait,
        wait_timeout: Duration::from_secs(wait_timeout),
    }
}

pub fn stop_options(timeout: u64) -> StopOptions {
    StopOptions {
        timeout: Duration::from_secs(timeout),
    }
}

pub fn remove_options(volumes: bool) -> RemoveOptions {
    RemoveOptions {
        force: true,
        volumes,
    }
}

pub fn pull_options(ignore_failures: bool, quiet: bool) -> PullOptions {
    PullOptions {
        ignore_failures,
        quiet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_options_and_subcommands() {
        let cli = Cli::try_parse_from([
            "bcompose", "-f", "a.yml", "-f", "b.yml", "-p", "demo", "-vv", "create",
            "--force-recreate",
        ])
        .unwrap();
        assert_eq!(cli.files, vec![PathBuf::from("a.yml"), PathBuf::from("b.yml")]);
        assert_eq!(cli.project_name.as_deref(), Some("demo"));
        assert_eq!(cli.log_level(), LevelFilter::Debug);
        match cli.command {
            Some(Command::Create(args)) => assert_eq!(args.options().recreate, Recreate::Force),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn recreate_flags_conflict() {
        let args = ["bcompose", "create", "--force-recreate", "--no-recreate"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn walkthrough_is_the_default() {
        let cli = Cli::try_parse_from(["bcompose"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or_default(), Command::Walkthrough(_)));
    }

    #[test]
    fn log_file_flag_without_value_uses_data_dir() {
        let cli = Cli::try_parse_from(["bcompose", "ls", "--log-file"]).unwrap();
        if let Some(path) = cli.log_file_path() {
            assert!(path.ends_with("bcompose.log"));
        }
        let cli = Cli::try_parse_from(["bcompose", "--log-file", "/tmp/x.log", "ls"]).unwrap();
        assert_eq!(cli.log_file_path(), Some(PathBuf::from("/tmp/x.log")));
    }

    #[test]
    fn option_helpers() {
        let start = start_options(true, 5);
        assert!(!start.wait);
        assert_eq!(start.wait_timeout, Duration::from_secs(5));
        assert_eq!(stop_options(3).timeout, Duration::from_secs(3));
        assert!(remove_options(true).volumes);
        assert!(pull_options(true, false).ignore_failures);
    }
}
