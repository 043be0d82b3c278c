use chrono::NaiveDate;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Daemon: pipeline now, then on every schedule tick.
    Run,
    Pipeline { date: Option<NaiveDate> },
    Fetch,
    Ingest { path: PathBuf, date: Option<NaiveDate> },
    Stats { date: Option<NaiveDate> },
    Distribution { path: PathBuf },
}

pub const USAGE: &str = "usage: ingester [run | pipeline [YYYY-MM-DD] | fetch | ingest <file> [YYYY-MM-DD] | stats [YYYY-MM-DD] | distribution <file>]";

fn parse_date(raw: Option<String>) -> Result<Option<NaiveDate>, String> {
    raw.map(|s| {
        NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| format!("invalid date {s:?}: {e}"))
    })
    .transpose()
}

pub fn parse_args<I>(mut args: I) -> Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // argv[0]
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    let command = match cmd.as_str() {
        "run" => Command::Run,
        "pipeline" => Command::Pipeline {
            date: parse_date(args.next())?,
        },
        "fetch" => Command::Fetch,
        "ingest" => {
            let path = args
                .next()
                .ok_or_else(|| "usage: ingester ingest <file> [YYYY-MM-DD]".to_string())?;
            Command::Ingest {
                path: PathBuf::from(path),
                date: parse_date(args.next())?,
            }
        }
        "stats" => Command::Stats {
            date: parse_date(args.next())?,
        },
        "distribution" => {
            let path = args
                .next()
                .ok_or_else(|| "usage: ingester distribution <file>".to_string())?;
            Command::Distribution {
                path: PathBuf::from(path),
            }
        }
        other => return Err(format!("unknown command: {other}\n{USAGE}")),
    };

    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument: {extra}\n{USAGE}"));
    }
    Ok(command)
}
