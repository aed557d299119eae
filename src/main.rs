// Copyright 2025 dentsusoken
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

use chrono::DateTime;
use clap::{Parser, Subcommand};
use portlock::config::PortlockConfig;
use portlock::error::{PortlockError, Result, format_error_chain, get_exit_code};
use portlock::locking::{LockManager, parse_wait_override};
use portlock::logging;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "portlock")]
#[command(author, version, about = "Cross-host file locks over shared filesystems", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold a lock on a file while running a command
    Run {
        /// File to lock
        file: PathBuf,

        /// Take a shared (read) lock instead of an exclusive one
        #[arg(short, long)]
        shared: bool,

        /// Wait budget in milliseconds, or 'infinite' (0 fails fast)
        #[arg(long, value_name = "MILLIS")]
        wait: Option<String>,

        /// Command to run while the lock is held
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Report whether a file is locked and who holds it
    Status {
        /// File to inspect
        file: PathBuf,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Hold a legacy single-holder device lock while running a command
    #[cfg(unix)]
    Device {
        /// Device name, with or without the /dev/ prefix
        device: String,

        /// Command to run while the lock is held
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::setup_logger(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", format_error_chain(&err));
            std::process::exit(get_exit_code(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let config = PortlockConfig::load(&config_home())?;
    let manager = LockManager::new(&config.locking);

    match cli.command {
        Commands::Run {
            file,
            shared,
            wait,
            command,
        } => {
            let wait_millis = match wait {
                Some(value) => {
                    parse_wait_override(&value).map_err(PortlockError::ValidationError)?
                }
                None => config.locking.default_wait_millis,
            };

            let token = manager.lock(&file, shared, wait_millis)?;
            let status = Command::new(&command[0]).args(&command[1..]).status();
            manager.unlock(token)?;

            let status = status.map_err(|err| {
                PortlockError::SystemError(format!("Failed to run '{}': {err}", command[0]))
            })?;
            Ok(status.code().unwrap_or(1))
        }

        Commands::Status { file, json } => {
            let locked = manager.is_locked(&file)?;
            let holders = manager.holders(&file)?;

            if json {
                let holders: Vec<_> = holders
                    .iter()
                    .map(|(member, values)| {
                        serde_json::json!({
                            "member": member,
                            "machine": values.machine_id,
                            "execution_id": values.execution_id,
                            "ticket": values.lamport,
                            "kind": values.kind,
                            "owner_started": owner_started(values.creation_time),
                        })
                    })
                    .collect();
                let payload = serde_json::json!({
                    "path": file,
                    "locked": locked,
                    "holders": holders,
                });
                let rendered = serde_json::to_string_pretty(&payload)
                    .map_err(|err| PortlockError::SystemError(err.to_string()))?;
                println!("{rendered}");
            } else if holders.is_empty() {
                println!(
                    "{}: {}",
                    file.display(),
                    if locked { "locked" } else { "unlocked" }
                );
            } else {
                println!("{}: locked", file.display());
                for (member, values) in &holders {
                    println!(
                        "  {member}  {} lock, ticket {}, owner {} on {} (started {})",
                        values.kind,
                        values.lamport,
                        values.execution_id,
                        values.machine_id,
                        owner_started(values.creation_time)
                    );
                }
            }
            Ok(0)
        }

        #[cfg(unix)]
        Commands::Device { device, command } => {
            use portlock::locking::{DefaultExecutionVerifier, acquire_device_lock};

            let verifier = DefaultExecutionVerifier;
            let guard = acquire_device_lock(&config.locking.device_lock_dir, &device, &verifier)?
                .ok_or_else(|| PortlockError::LockTimeout {
                    path: device.clone(),
                    waited_secs: 0.0,
                    details: "device lock held by a live process".to_string(),
                })?;

            let status = Command::new(&command[0]).args(&command[1..]).status();
            guard.release()?;

            let status = status.map_err(|err| {
                PortlockError::SystemError(format!("Failed to run '{}': {err}", command[0]))
            })?;
            Ok(status.code().unwrap_or(1))
        }
    }
}

fn owner_started(creation_time: u64) -> String {
    DateTime::from_timestamp(creation_time as i64, 0)
        .map(|timestamp| timestamp.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn config_home() -> PathBuf {
    std::env::var_os("PORTLOCK_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
