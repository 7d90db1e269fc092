use anyhow::Context;
use jcalc::shell::Shell;
use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

fn main() -> anyhow::Result<()> {
	let mut shell = Shell::new().context("failed to map executable memory")?;
	shell.disassemble = env::var_os("JCALC_DISASM").is_some();
	jcalc::runtime::fault::install(shell.memory())
		.context("failed to install the fault handler")?;

	match env::args().nth(1) {
		Some(path) => batch(&mut shell, &path),
		None => interactive(&mut shell),
	}
}

/// Read-eval-print until EOF.
fn interactive(shell: &mut Shell) -> anyhow::Result<()> {
	let stdin = io::stdin();
	let mut line = String::new();
	loop {
		eprint!(">>> ");
		line.clear();
		if stdin.read_line(&mut line).context("failed to read stdin")? == 0 {
			eprintln!();
			return Ok(());
		}
		run_line(shell, &line);
	}
}

/// Run a file line by line; bad lines are reported and skipped, same as
/// interactively.
fn batch(shell: &mut Shell, path: &str) -> anyhow::Result<()> {
	let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
	for line in BufReader::new(file).lines() {
		run_line(shell, &line.context("failed to read input")?);
	}
	Ok(())
}

fn run_line(shell: &mut Shell, line: &str) {
	if line.trim().is_empty() {
		return;
	}
	match shell.evaluate(line) {
		Ok(Some(value)) => println!("{}", value),
		Ok(None) => (),
		Err(e) => eprintln!("\x1b[0;31m{}\x1b[0m: {}", e.category(), e),
	}
}
