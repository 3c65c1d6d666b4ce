use std::{
    env,
    io::{self, BufRead, Write},
    path::PathBuf,
    process::ExitCode,
};

use nial::{parse_size, HeapLimits, Session, SessionOutcome, StdPrint, TopRequest};

const USAGE: &str = "\
usage: nial [flags]
   -size N[K|M|G]   initial heap size in words, expansion allowed up to a cap
   +size N[K|M|G]   initial heap size in words, expansion disallowed
   -defs Filename   after startup, read and silently execute Filename.ndf
   -lws Filename    load a previously saved workspace from Filename.nws
   -i               enter the interactive top-level loop with triggering on
   -h               print this syntax summary and exit
";

struct Flags {
    limits: HeapLimits,
    defs: Option<PathBuf>,
    workspace: Option<PathBuf>,
    interactive: bool,
}

fn parse_flags(args: &[String]) -> Result<Option<Flags>, String> {
    let mut limits = HeapLimits::default();
    let mut defs = None;
    let mut workspace = None;
    let mut interactive = false;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" => return Ok(None),
            "-i" => interactive = true,
            "-size" | "+size" => {
                let fixed = args[i] == "+size";
                i += 1;
                let value = args.get(i).ok_or_else(|| format!("{} requires a value", args[i - 1]))?;
                let words = parse_size(value).ok_or_else(|| format!("invalid size: {value}"))?;
                limits = if fixed {
                    HeapLimits::fixed(words)
                } else {
                    HeapLimits::expandable(words)
                };
            }
            "-defs" => {
                i += 1;
                let value = args.get(i).ok_or("(-defs requires a file name)")?;
                defs = Some(with_extension(value, "ndf"));
            }
            "-lws" => {
                i += 1;
                let value = args.get(i).ok_or("(-lws requires a file name)")?;
                workspace = Some(with_extension(value, "nws"));
            }
            other => return Err(format!("unknown flag: {other}")),
        }
        i += 1;
    }
    Ok(Some(Flags {
        limits,
        defs,
        workspace,
        interactive,
    }))
}

/// Adds the conventional extension when the name does not already carry it.
fn with_extension(name: &str, ext: &str) -> PathBuf {
    let mut path = PathBuf::from(name);
    if path.extension().is_none() {
        path.set_extension(ext);
    }
    path
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let flags = match parse_flags(&args) {
        Ok(Some(flags)) => flags,
        Ok(None) => {
            print!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("error: {message}");
            eprint!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let mut session = Session::new(flags.limits);
    let mut print = StdPrint;

    if let Some(path) = &flags.workspace {
        if let Err(message) = session.load_workspace(path) {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    }
    if let Some(path) = &flags.defs {
        if let Err(message) = session.loaddefs(path, &mut print) {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    }

    if flags.interactive {
        session.set_triggering(true);
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("     ");
        let _ = io::stdout().flush();
        let Some(Ok(line)) = lines.next() else {
            return ExitCode::SUCCESS; // end of input is a clean exit
        };
        match session.execute(&line, &mut print) {
            SessionOutcome::Continue(TopRequest::None) => {}
            SessionOutcome::Continue(TopRequest::SaveWs(name)) => {
                let path = with_extension(&name, "nws");
                if let Err(message) = session.save_workspace(&path) {
                    eprintln!("error: {message}");
                }
            }
            SessionOutcome::Continue(TopRequest::LoadWs(name)) => {
                let path = with_extension(&name, "nws");
                if let Err(message) = session.load_workspace(&path) {
                    eprintln!("error: {message}");
                }
            }
            SessionOutcome::Bye => return ExitCode::SUCCESS,
            SessionOutcome::Fatal(message) => {
                eprintln!("fatal: {message}");
                return ExitCode::FAILURE;
            }
        }
    }
}
