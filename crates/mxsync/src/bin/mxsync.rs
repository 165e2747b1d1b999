use mxsync::cli::{self, Outcome};
use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    match cli::run()? {
        Outcome::Success => Ok(ExitCode::SUCCESS),
        Outcome::CheckFailed => Ok(ExitCode::FAILURE),
    }
}
