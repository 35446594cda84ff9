use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask", about = "fleetlink development tasks")]
struct Xtask {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Render man pages for fleetlink and its subcommands
    Man {
        /// Output directory
        #[arg(long, default_value = "target/man")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    match Xtask::parse().command {
        Task::Man { out_dir } => {
            let written = render_man_pages(&out_dir)?;
            for path in written {
                println!("{}", path.display());
            }
            Ok(())
        }
    }
}

/// Write `fleetlink.1` plus one page per subcommand (`fleetlink-simulate.1`, ...).
fn render_man_pages(out_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let cmd = fleetlink_cli::Cli::command();
    let mut written = vec![write_page(out_dir, "fleetlink", cmd.clone())?];
    for sub in cmd.get_subcommands() {
        let name = format!("fleetlink-{}", sub.get_name());
        let page = sub.clone().name(name.clone());
        written.push(write_page(out_dir, &name, page)?);
    }
    Ok(written)
}

fn write_page(out_dir: &Path, name: &str, cmd: clap::Command) -> Result<PathBuf> {
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buffer)
        .with_context(|| format!("Failed to render man page for {}", name))?;
    let path = out_dir.join(format!("{}.1", name));
    std::fs::write(&path, buffer).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
