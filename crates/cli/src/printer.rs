use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use rewind_core::{DryRunMode, ResourceHandle};
use rewind_undo::Printer;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// `kind.group/name <what happened>`
    #[default]
    Name,
    Json,
    Yaml,
}

/// Writes one record per outcome to `out`.
pub struct OutcomePrinter<W: Write + Send> {
    format: OutputFormat,
    dry_run: DryRunMode,
    out: W,
}

impl<W: Write + Send> OutcomePrinter<W> {
    pub fn new(format: OutputFormat, dry_run: DryRunMode, out: W) -> Self {
        Self { format, dry_run, out }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Printer for OutcomePrinter<W> {
    fn print(&mut self, target: &ResourceHandle, description: &str) -> Result<()> {
        match self.format {
            OutputFormat::Name => {
                writeln!(self.out, "{} {}{}", target.display_name(), description, self.dry_run.suffix())?;
            }
            OutputFormat::Json => {
                writeln!(self.out, "{}", serde_json::to_string_pretty(&target.object)?)?;
            }
            OutputFormat::Yaml => {
                write!(self.out, "---\n{}", serde_yaml::to_string(&target.object)?)?;
            }
        }
        self.out.flush()?;
        Ok(())
    }
}
