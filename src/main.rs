use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    let code = fleetlink_cli::run()?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
