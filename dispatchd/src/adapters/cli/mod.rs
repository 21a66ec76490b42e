// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};

use crate::app::services::params::parse_param_pairs;
use crate::app::types::{JobSpec, Params};

#[derive(Parser, Debug)]
#[command(
    name = "dispatchd",
    version,
    about,
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < DISPATCHD_CONFIG_PATH < command-line flags.\n\
If --config is omitted, dispatchd tries DISPATCHD_CONFIG_PATH, then the default config file location; missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, dispatchd uses DISPATCHD_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a job from a TOML or JSON job file.
    Submit {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_name = "NAME")]
        provider: String,
        /// Instance parameter override, repeatable.
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
        #[arg(long, value_name = "SECS")]
        run_timeout_secs: Option<u64>,
        /// Drive the job to completion right away instead of leaving it to `serve`.
        #[arg(long)]
        run: bool,
    },
    /// Drive a created job through the pipeline.
    Run {
        #[arg(value_name = "JOB_UID")]
        job_uid: String,
    },
    ListJobs {
        #[arg(long, value_name = "NAME")]
        provider: Option<String>,
    },
    ListInstances {
        #[arg(long, value_name = "NAME")]
        provider: Option<String>,
    },
    /// Cloud instances labelled with this orchestrator's identifier.
    ListCloudJobs {
        #[arg(long, value_name = "NAME")]
        provider: Option<String>,
    },
    ListImages {
        #[arg(long, value_name = "NAME")]
        provider: String,
    },
    /// Create a cloud instance outside of any job.
    CreateInstance {
        #[arg(long, value_name = "NAME")]
        provider: String,
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Fail abandoned jobs and clean up finished ones once.
    Reclaim,
    /// Run the dispatch, heartbeat and reclaim loop (default).
    Serve {
        #[arg(
            long,
            value_name = "SECS",
            help = "How often to check jobs. Overrides `job_check_interval_secs` from the config file."
        )]
        job_check_interval_secs: Option<u64>,
        #[arg(
            long,
            value_name = "PORT",
            help = "Heartbeat port probed on instances. Overrides `heartbeat_port` from the config file."
        )]
        heartbeat_port: Option<u16>,
    },
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
}

const HELP_TEMPLATE: &str = "\
{before-help}{about-with-newline}{usage-heading} {usage}
{after-help}

{all-args}
";

fn apply_help_template_recursively(cmd: &mut clap::Command) {
    let mut owned = std::mem::take(cmd);
    owned = owned.help_template(HELP_TEMPLATE);
    for sub in owned.get_subcommands_mut() {
        apply_help_template_recursively(sub);
    }
    *cmd = owned;
}

pub fn cli_command() -> clap::Command {
    let mut cmd = Opts::command();
    apply_help_template_recursively(&mut cmd);
    cmd
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let verbose_override = matches.get_flag("verbose").then_some(true);
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts {
        opts,
        verbose_override,
    }
}

pub fn parse_params(pairs: &[String]) -> Result<Params> {
    parse_param_pairs(pairs).map_err(anyhow::Error::msg)
}

/// Reads a job file; `.json` files are JSON, everything else TOML.
pub fn load_job_spec(path: &Path) -> Result<JobSpec> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job file {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse job file {}", path.display()))
    } else {
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse job file {}", path.display()))
    }
}
