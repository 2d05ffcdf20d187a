//! Build script rendering the `prewarm` man pages.
//!
//! Writes `prewarm.1` plus one `prewarm-<subcommand>.1` page per subcommand
//! into `OUT_DIR` for packaging.

use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: &Man, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    fs::write(path, buffer)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR was not set")?);

    let command = Cli::command();
    for subcommand in command.get_subcommands() {
        let name = format!("prewarm-{}", subcommand.get_name());
        let page = out_dir.join(format!("{name}.1"));
        render(&Man::new(subcommand.clone()).title(name), &page)?;
    }
    render(&Man::new(command), &out_dir.join("prewarm.1"))
}
