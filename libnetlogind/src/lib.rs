// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, io, path::PathBuf, sync::Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::error;

pub use auth::{Adapter, Verdict};

pub mod auth;
mod client;
mod config;
mod consts;
pub mod conversation;
mod daemon;
mod platform;
pub mod protocol;
pub mod secret;
mod tty;
mod user;

/// The command line arguments that netlogind expects. These can be
/// directly parsed with clap or manually constructed in order to
/// present some other user interface.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In client mode logs are discarded by default. The daemon logs to
stderr until it detaches, so a daemonized listener needs this flag
for its logs to go anywhere."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on

This defaults to /tmp/netlogind.sock and may also be set in the
config file; this flag wins over both."
    )]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(long, action, help = "Connect to a running daemon instead of serving")]
    pub client: bool,

    #[clap(
        long,
        action,
        help = "Run the daemon in the foreground, serve a single connection, and log verbosely"
    )]
    pub debug: bool,

    #[clap(
        long,
        action,
        help = "Skip the authentication dialogue; sessions still resolve and become the named account (development only)"
    )]
    pub noauth: bool,
}

/// Run the netlogind tool with the given arguments. If auth is
/// provided, the daemon drives the injected back end for its
/// authentication dialogue; with no back end (or with --noauth)
/// sessions skip authentication the way a PAM-less build of a login
/// daemon would.
pub fn run(args: Args, auth: Option<Box<dyn auth::Adapter + Send>>) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 && args.debug {
        tracing::Level::DEBUG
    } else if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .init();
    } else if args.client {
        // keep protocol text on stdout clean; errors still surface
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::ERROR)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_target(false)
            .with_writer(io::stderr)
            .init();
    }

    let config = match config::read_config(&args.config_file) {
        Ok(config) => config,
        Err(err) => {
            error!("{:?}", err);
            std::process::exit(1);
        }
    };
    let socket = args
        .socket
        .as_ref()
        .map(PathBuf::from)
        .or_else(|| config.socket.clone())
        .unwrap_or_else(|| PathBuf::from(consts::SOCK_PATH));

    let res: anyhow::Result<()> = if args.client {
        match client::run(&socket) {
            Ok(0) => Ok(()),
            Ok(status) => std::process::exit(status),
            Err(err) => Err(err).context("client session"),
        }
    } else {
        daemon::run(&args, config, auth, socket)
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
