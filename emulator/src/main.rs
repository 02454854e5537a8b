mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use session::{Session, SessionOptions};

const USAGE: &str =
    "Usage: radio-emulator [--script-steps <count>] [--transcript <path>] [--verbose]";

struct Args {
    options: SessionOptions,
    transcript: Option<PathBuf>,
    verbose: bool,
}

fn main() -> io::Result<()> {
    let args = parse_args(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(args.options, args.transcript.as_deref())?;
    let mut line = String::new();

    writeln!(
        writer,
        "Radio Controller Emulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed)? {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut parsed = Args {
        options: SessionOptions::default(),
        transcript: None,
        verbose: false,
    };

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        match flag.as_str() {
            "--verbose" | "-v" => parsed.verbose = true,
            "--script-steps" => {
                let value = inline
                    .or_else(|| args.next())
                    .ok_or("Expected value after --script-steps")?;
                parsed.options.script_steps = value
                    .parse()
                    .map_err(|_| format!("Invalid script step count `{value}`"))?;
            }
            "--transcript" => {
                let value = inline
                    .or_else(|| args.next())
                    .ok_or("Expected value after --transcript")?;
                parsed.transcript = Some(PathBuf::from(value));
            }
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }

    Ok(parsed)
}
