#![forbid(unsafe_code)]

//! `agent-relay-ctl`: local CLI companion for `agent-relay`.
//!
//! Connects to the command socket, sends one JSON command, and prints the
//! response payload.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[command(
    name = "agent-relay-ctl",
    about = "Local CLI for the agent-relay server",
    version,
    long_about = None
)]
struct Cli {
    /// Command socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "agent-relay")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a session.
    Create {
        /// Working directory relative to the new workspace.
        #[arg(long)]
        cwd: Option<String>,
        /// Tool the agent may run without asking (repeatable).
        #[arg(long = "allow")]
        execution_targets: Vec<String>,
        /// Initial permission mode: bypass or plan.
        #[arg(long)]
        mode: Option<String>,
    },

    /// Send a prompt to a session.
    Prompt {
        /// Session id.
        id: String,
        /// Prompt text.
        text: String,
    },

    /// Send a slash command to a session.
    Slash {
        /// Session id.
        id: String,
        /// Command name.
        name: String,
        /// Command arguments.
        args: Option<String>,
    },

    /// Interrupt the running turn.
    Cancel {
        /// Session id.
        id: String,
    },

    /// Switch permission mode.
    Mode {
        /// Session id.
        id: String,
        /// Target mode: bypass or plan.
        mode: String,
    },

    /// Answer a pending question.
    Answer {
        /// Session id.
        id: String,
        /// Question id.
        question_id: String,
        /// Answer text.
        text: String,
    },

    /// Decide a pending permission request.
    Respond {
        /// Session id.
        id: String,
        /// Permission id.
        permission_id: String,
        /// allow, allow_always, or deny.
        decision: String,
    },

    /// Terminate one or more sessions.
    Terminate {
        /// Session ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List live sessions.
    List,

    /// Describe one or more sessions.
    Info {
        /// Session ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Print a session's output history.
    Output {
        /// Session id.
        id: String,
        /// First history index to return.
        #[arg(long)]
        offset: Option<usize>,
    },

    /// List unresolved questions and permission requests.
    Pending {
        /// Restrict to one session.
        id: Option<String>,
    },

    /// Read a file from a session workspace.
    Cat {
        /// Session id.
        id: String,
        /// Path relative to the workspace.
        path: String,
    },

    /// List a directory in a session workspace.
    Ls {
        /// Session id.
        id: String,
        /// Path relative to the workspace.
        path: Option<String>,
    },

    /// Stat a path in a session workspace.
    Stat {
        /// Session id.
        id: String,
        /// Path relative to the workspace.
        path: String,
    },
}

impl Command {
    fn to_request(&self) -> Value {
        match self {
            Self::Create {
                cwd,
                execution_targets,
                mode,
            } => json!({
                "command": "create",
                "cwd": cwd,
                "execution_targets": execution_targets,
                "mode": mode,
            }),
            Self::Prompt { id, text } => json!({ "command": "prompt", "id": id, "text": text }),
            Self::Slash { id, name, args } => {
                json!({ "command": "slash", "id": id, "name": name, "args": args })
            }
            Self::Cancel { id } => json!({ "command": "cancel", "id": id }),
            Self::Mode { id, mode } => json!({ "command": "mode", "id": id, "mode": mode }),
            Self::Answer {
                id,
                question_id,
                text,
            } => json!({
                "command": "answer",
                "id": id,
                "question_id": question_id,
                "text": text,
            }),
            Self::Respond {
                id,
                permission_id,
                decision,
            } => json!({
                "command": "respond",
                "id": id,
                "permission_id": permission_id,
                "decision": decision,
            }),
            Self::Terminate { ids } => match ids.as_slice() {
                [id] => json!({ "command": "terminate", "id": id }),
                _ => json!({ "command": "batch_terminate", "ids": ids }),
            },
            Self::List => json!({ "command": "list" }),
            Self::Info { ids } => match ids.as_slice() {
                [id] => json!({ "command": "info", "id": id }),
                _ => json!({ "command": "batch_info", "ids": ids }),
            },
            Self::Output { id, offset } => json!({ "command": "output", "id": id, "offset": offset }),
            Self::Pending { id } => json!({ "command": "pending", "id": id }),
            Self::Cat { id, path } => json!({ "command": "read_file", "id": id, "path": path }),
            Self::Ls { id, path } => json!({ "command": "list_files", "id": id, "path": path }),
            Self::Stat { id, path } => json!({ "command": "stat_file", "id": id, "path": path }),
        }
    }
}

fn main() {
    let args = Cli::parse();
    let request = args.command.to_request();

    match send_ipc_command(&args.ipc_name, &request) {
        Ok(response) => {
            let ok = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
            if ok {
                match response.get("data") {
                    Some(data) if !data.is_null() => {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    }
                    _ => println!("OK"),
                }
            } else {
                let error = response.get("error");
                let code = error
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_str)
                    .unwrap_or("internal");
                let message = error
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                eprintln!("Error [{code}]: {message}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is agent-relay running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the command socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &Value,
) -> std::result::Result<Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    Ok(serde_json::from_str(response_line.trim())?)
}
