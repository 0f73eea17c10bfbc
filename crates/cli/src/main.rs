use std::process::ExitCode;

fn main() -> ExitCode {
    nsmr_cli::run()
}
