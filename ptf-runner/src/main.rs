use std::process::ExitCode;

fn main() -> ExitCode {
  ptf_runner::cli::main_with(ptf_runner::builtin::registry())
}
