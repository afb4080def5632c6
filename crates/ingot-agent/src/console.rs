use std::path::PathBuf;

/// One line of admin input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start { name: String, config: PathBuf },
    QuickStart { name: String },
    Stop { name: String },
    Restart { name: String },
    Delete { name: String },
    Status { name: Option<String> },
    Logs { name: String, lines: usize },
    Follow { name: String },
    Rcon { name: String, command: String },
    Binaries,
    Help,
    Quit,
}

pub const DEFAULT_LOG_LINES: usize = 50;
const MAX_LOG_LINES: usize = 5000;

pub const HELP: &str = "\
start <name> <config.json>   launch with the given config (saved on success)
quick-start <name>           launch with the stored config
stop <name>                  graceful stop, escalating to kill
restart <name>               stop, then relaunch with the running config
delete <name>                stop and remove the instance directory
status [name]                one instance, or all known instances
logs <name> [n]              last n log lines (default 50)
follow <name>                stream the log until Ctrl-C
rcon <name> <command...>     send one console command over RCON
binaries                     list server jars
help | quit";

fn required<'a>(it: &mut impl Iterator<Item = &'a str>, what: &str, usage: &str) -> Result<String, String> {
    it.next()
        .map(str::to_string)
        .ok_or_else(|| format!("missing {what}; usage: {usage}"))
}

/// `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let mut it = line.split_whitespace();
    let Some(verb) = it.next() else {
        return Ok(None);
    };

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Start {
            name: required(&mut it, "name", "start <name> <config.json>")?,
            config: PathBuf::from(required(&mut it, "config path", "start <name> <config.json>")?),
        },
        "quick-start" => ConsoleCommand::QuickStart {
            name: required(&mut it, "name", "quick-start <name>")?,
        },
        "stop" => ConsoleCommand::Stop {
            name: required(&mut it, "name", "stop <name>")?,
        },
        "restart" => ConsoleCommand::Restart {
            name: required(&mut it, "name", "restart <name>")?,
        },
        "delete" => ConsoleCommand::Delete {
            name: required(&mut it, "name", "delete <name>")?,
        },
        "status" => ConsoleCommand::Status {
            name: it.next().map(str::to_string),
        },
        "logs" => {
            let name = required(&mut it, "name", "logs <name> [n]")?;
            let lines = match it.next() {
                Some(n) => n
                    .parse::<usize>()
                    .map_err(|_| format!("invalid line count: {n}"))?
                    .clamp(1, MAX_LOG_LINES),
                None => DEFAULT_LOG_LINES,
            };
            ConsoleCommand::Logs { name, lines }
        }
        "follow" => ConsoleCommand::Follow {
            name: required(&mut it, "name", "follow <name>")?,
        },
        "rcon" => {
            let name = required(&mut it, "name", "rcon <name> <command...>")?;
            // Keep the command text as typed after the name.
            let rest = line
                .split_once(char::is_whitespace)
                .map(|(_, r)| r.trim_start())
                .and_then(|r| r.split_once(char::is_whitespace))
                .map(|(_, r)| r.trim())
                .unwrap_or("");
            if rest.is_empty() {
                return Err("missing command; usage: rcon <name> <command...>".to_string());
            }
            ConsoleCommand::Rcon {
                name,
                command: rest.to_string(),
            }
        }
        "binaries" => ConsoleCommand::Binaries,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}'; try 'help'")),
    };
    Ok(Some(cmd))
}
