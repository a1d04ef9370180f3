//! oc-shader-cache - maintenance tool for the oxidized-cell shader cache
//!
//! Usage: `oc-shader-cache <stats|clear-host|verify> [DIR]`

use anyhow::{anyhow, bail, Context};
use oc_core::{logging, Config};
use oc_shader_cache::program_store::{clear_all_host_stores, has_guest_store, list_host_stores};
use oc_shader_cache::{ProgramStore, CODEGEN_VERSION};
use std::path::{Path, PathBuf};

const USAGE: &str = "usage: oc-shader-cache <stats|clear-host|verify> [DIR]";

fn main() -> anyhow::Result<()> {
    let config = Config::load().map_err(|e| anyhow!("failed to load config: {}", e))?;
    logging::init(config.debug.log_level);

    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        bail!(USAGE);
    };
    let dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.shader_cache.path.clone());

    match command.as_str() {
        "stats" => stats(&dir),
        "clear-host" => clear_host(&dir),
        "verify" => verify(&dir),
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
}

fn stats(dir: &Path) -> anyhow::Result<()> {
    if !has_guest_store(dir) {
        println!("No shader cache in {}", dir.display());
        return Ok(());
    }

    let store = ProgramStore::new(dir);
    println!("Shader cache: {}", dir.display());
    println!("  Guest shaders: {}", store.guest_entry_count()?);
    println!("  Programs:      {}", store.program_count()?);

    for host in list_host_stores(dir)? {
        let version = match host.codegen_version {
            Some(v) if v == CODEGEN_VERSION => format!("codegen {}", v),
            Some(v) => format!("codegen {} (stale, current is {})", v, CODEGEN_VERSION),
            None => "invalid header".to_string(),
        };
        println!(
            "  Host {}/{}: {} binaries, {}",
            host.key.api, host.key.vendor, host.entry_count, version
        );
    }
    Ok(())
}

fn clear_host(dir: &Path) -> anyhow::Result<()> {
    let removed = clear_all_host_stores(dir)
        .with_context(|| format!("failed to clear host caches in {}", dir.display()))?;
    println!("Removed {} host shader cache(s) from {}", removed, dir.display());
    Ok(())
}

fn verify(dir: &Path) -> anyhow::Result<()> {
    if !has_guest_store(dir) {
        bail!("no shader cache in {}", dir.display());
    }

    let report = ProgramStore::new(dir)
        .verify()
        .with_context(|| format!("failed to read shader cache in {}", dir.display()))?;
    println!(
        "{} of {} programs readable ({} guest shaders)",
        report.readable, report.program_count, report.guest_entries
    );

    for host in list_host_stores(dir)? {
        let store = ProgramStore::with_host(dir, host.key.clone());
        let host_report = store.verify()?;
        println!(
            "  Host {}/{}: {} usable binaries",
            host.key.api, host.key.vendor, host_report.host_binaries
        );
    }

    if report.readable != report.program_count {
        bail!(
            "{} program(s) could not be read",
            report.program_count - report.readable
        );
    }
    tracing::info!("Shader cache in {} verified", dir.display());
    Ok(())
}
