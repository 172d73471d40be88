use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use clap::CommandFactory;
use clap_complete::{generate, Shell};

use crate::cli::{Cli, CompletionShell};
use crate::error::CliError;

impl From<CompletionShell> for Shell {
    fn from(value: CompletionShell) -> Self {
        match value {
            CompletionShell::Bash => Self::Bash,
            CompletionShell::Zsh => Self::Zsh,
            CompletionShell::Fish => Self::Fish,
        }
    }
}

pub fn run_completions(shell: CompletionShell, output_path: Option<&Path>) -> Result<(), CliError> {
    match output_path {
        Some(path) => {
            let mut file = File::create(path)?;
            write_completions(shell, &mut file);
            file.flush()?;
            eprintln!("Wrote {shell:?} completions to {}", path.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            write_completions(shell, &mut stdout);
            stdout.flush()?;
        }
    }
    Ok(())
}

pub fn render_completions(shell: CompletionShell) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_completions(shell, &mut buffer);
    buffer
}

fn write_completions(shell: CompletionShell, out: &mut dyn Write) {
    let mut command = Cli::command();
    let bin_name = command.get_name().to_string();
    generate(Shell::from(shell), &mut command, bin_name, out);
}
