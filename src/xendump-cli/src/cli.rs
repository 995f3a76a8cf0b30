//! CLI argument definitions for xendump.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "xendump")]
#[command(about = "Analyse a Xen crash in the kdump environment", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Core crash file
    #[arg(short, long, default_value = "/proc/vmcore")]
    pub core: PathBuf,

    /// Directory for output files (created if missing)
    #[arg(short, long)]
    pub outdir: PathBuf,

    /// Xen symbol table file (nm format)
    #[arg(short = 'x', long)]
    pub xen_symtab: PathBuf,

    /// Xen structure field offsets file
    #[arg(long)]
    pub xen_offsets: PathBuf,

    /// Dom0 kernel symbol table file (System.map format)
    #[arg(short = 'd', long)]
    pub dom0_symtab: PathBuf,

    /// Symbol holding the head of the domain list
    #[arg(long, default_value = "domain_list")]
    pub anchor: String,

    /// Dom0 kernel global to sample into the report (repeatable)
    #[arg(long = "dom0-global", value_name = "NAME")]
    pub dom0_globals: Vec<String>,

    /// Less logging
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// More logging, repeat for extra debug detail
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Default tracing filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "xendump=error";
        }
        match self.verbose {
            0 => "xendump=info",
            1 => "xendump=debug",
            _ => "xendump=trace",
        }
    }
}
