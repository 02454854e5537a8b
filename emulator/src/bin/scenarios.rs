use std::io::{self, Write};

#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Session, SessionOptions};

/// Canned command lists replayed against a fresh session each.
const SCENARIOS: &[(&str, &[&str])] = &[
    (
        "shared bring-up",
        &[
            "on bt", "on fm", "status", "run", "on gps", "off bt", "off fm", "off gps", "run",
            "status",
        ],
    ),
    (
        "abort during init script",
        &["on bt", "step 2", "abort bt", "run", "status", "log"],
    ),
    (
        "failed bring-up and recovery",
        &["on bt", "on gps", "fail", "step", "status", "reset", "on bt", "run", "status"],
    ),
];

fn main() -> io::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let stdout = io::stdout();
    let mut writer = stdout.lock();
    for (title, commands) in SCENARIOS {
        writeln!(writer, "== {title}")?;
        let mut session = Session::new(SessionOptions::default(), None)?;
        for command in *commands {
            writeln!(writer, "> {command}")?;
            for line in session.handle_command(command)? {
                writeln!(writer, "{line}")?;
            }
        }
        writeln!(writer)?;
    }
    Ok(())
}
